//! Search progress reporting.
//!
//! Reports what a search run is doing: loading files, building the index,
//! how many queries are done, and the final tally. The same events drive
//! the job status message polled by the UI and, for `search` on the
//! command line, a reporter writing to **stderr** so stdout stays parseable.

use std::io::Write;

use serde::Serialize;

/// A single progress event for a search run.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SearchProgressEvent {
    /// Reading a spectral file.
    Loading { file: String },
    /// Building fragment, loss and precursor indexes.
    Indexing { spectra: u64 },
    /// `n` of `total` queries finished.
    Searching { n: u64, total: u64 },
    /// Run complete. `searched` includes skipped and failed queries.
    Finished { searched: u64, skipped: u64, failed: u64 },
}

impl SearchProgressEvent {
    /// Human-readable status line, also used as the job status message.
    pub fn message(&self) -> String {
        match self {
            SearchProgressEvent::Loading { file } => format!("Loading {}...", file),
            SearchProgressEvent::Indexing { spectra } => format!(
                "Building index for {} library spectra...",
                format_number(*spectra)
            ),
            SearchProgressEvent::Searching { n, total } => format!(
                "{} / {} spectra searched",
                format_number(*n),
                format_number(*total)
            ),
            SearchProgressEvent::Finished {
                searched,
                skipped,
                failed,
            } => {
                let mut msg = format!("Finished: {} spectra searched", format_number(*searched));
                if *skipped > 0 {
                    msg.push_str(&format!(", {} skipped (unknown charge)", format_number(*skipped)));
                }
                if *failed > 0 {
                    msg.push_str(&format!(", {} failed", format_number(*failed)));
                }
                msg
            }
        }
    }
}

/// Reports search progress. Implementations must be cheap; they are called
/// from the coordinating thread after every query.
pub trait SearchProgressReporter: Send + Sync {
    fn report(&self, event: SearchProgressEvent);
}

/// Human-friendly progress on stderr: "search  1,234 / 5,000 spectra searched".
pub struct StderrProgress;

impl SearchProgressReporter for StderrProgress {
    fn report(&self, event: SearchProgressEvent) {
        let line = format!("search  {}\n", event.message());
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SearchProgressReporter for JsonProgress {
    fn report(&self, event: SearchProgressEvent) {
        let mut obj = serde_json::to_value(&event).unwrap_or_default();
        if let Some(map) = obj.as_object_mut() {
            map.insert("event".to_string(), serde_json::json!("progress"));
        }
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SearchProgressReporter for NoProgress {
    fn report(&self, _event: SearchProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SearchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
