//! Mascot Generic Format reader.
//!
//! Records sit between `BEGIN IONS` and `END IONS`; headers are `KEY=value`
//! and peaks are `mz intensity [charge]` lines. Text outside records and
//! comment lines (`#`, `;`, `!`, `/`) are ignored.

use std::path::Path;

use super::{parse_peak_pair, Collector, LoadOptions, Loaded, RawRecord};
use crate::error::SearchError;

fn is_comment(line: &str) -> bool {
    matches!(line.chars().next(), Some('#' | ';' | '!' | '/'))
}

pub fn parse(path: &Path, text: &str, opts: &LoadOptions) -> Result<Loaded, SearchError> {
    let mut collector = Collector::new(path, opts);
    let mut record: Option<RawRecord> = None;
    let mut error: Option<String> = None;
    let mut record_no = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || is_comment(line) {
            continue;
        }

        if line.eq_ignore_ascii_case("BEGIN IONS") {
            if record.is_some() {
                return Err(SearchError::record(path, record_no, "missing END IONS"));
            }
            record_no += 1;
            record = Some(RawRecord::default());
            error = None;
            continue;
        }

        if line.eq_ignore_ascii_case("END IONS") {
            let Some(finished) = record.take() else {
                return Err(SearchError::record(path, record_no + 1, "END IONS without BEGIN IONS"));
            };
            let result = match error.take() {
                Some(message) => Err(message),
                None => finished.into_spectrum(record_no as u32),
            };
            collector.push(record_no, result)?;
            continue;
        }

        let Some(current) = record.as_mut() else {
            continue;
        };

        let starts_numeric = line
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == '.');
        if !starts_numeric {
            if let Some((key, value)) = line.split_once('=') {
                current.header(key, value);
                continue;
            }
        }

        match parse_peak_pair(line) {
            Some((mz, intensity)) => current.peak(mz, intensity),
            None => {
                if error.is_none() {
                    error = Some(format!("unparsable peak line: {}", line));
                }
            }
        }
    }

    if record.is_some() {
        return Err(SearchError::record(path, record_no, "missing END IONS"));
    }

    Ok(collector.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERIES: &str = "\
# exported by an instrument
BEGIN IONS
TITLE=query 1
PEPMASS=300.1 1500.0
CHARGE=1+
RTINSECONDS=120.5
100.0 50
150.0 100
END IONS

BEGIN IONS
TITLE=query 2
PEPMASS=250.2
CHARGE=2-
SCANS=88
90.5\t10\t1
120.25\t30
END IONS
";

    fn parse_str(text: &str, opts: &LoadOptions) -> Result<Loaded, SearchError> {
        parse(Path::new("queries.mgf"), text, opts)
    }

    #[test]
    fn parses_ions_blocks() {
        let loaded = parse_str(QUERIES, &LoadOptions::default()).unwrap();
        assert_eq!(loaded.spectra.len(), 2);

        let first = &loaded.spectra[0];
        assert_eq!(first.scan(), 1);
        assert_eq!(first.name(), Some("query 1"));
        assert_eq!(first.precursor_mz(), 300.1);
        assert_eq!(first.charge(), 1);
        assert_eq!(first.retention_time(), Some(120.5));
        assert_eq!(first.peaks().len(), 2);

        let second = &loaded.spectra[1];
        assert_eq!(second.scan(), 2);
        assert_eq!(second.charge(), -2);
        assert_eq!(second.peaks()[0].mz, 90.5);
        assert!(second.metadata().contains_key("scans"));
    }

    #[test]
    fn missing_end_ions_is_an_error() {
        let err = parse_str("BEGIN IONS\nPEPMASS=200\n100 1\n", &LoadOptions::default()).unwrap_err();
        assert!(err.to_string().contains("missing END IONS"));
    }

    #[test]
    fn invalid_record_skipped_when_lenient() {
        let text = "BEGIN IONS\nTITLE=bad\n100 1\nEND IONS\nBEGIN IONS\nPEPMASS=200\n100 1\nEND IONS\n";
        let strict = parse_str(text, &LoadOptions::default()).unwrap_err();
        assert!(strict.to_string().contains("record 1"));

        let lenient = parse_str(text, &LoadOptions { skip_invalid: true }).unwrap();
        assert_eq!(lenient.spectra.len(), 1);
        assert_eq!(lenient.skipped, 1);
        assert_eq!(lenient.spectra[0].scan(), 2);
    }
}
