//! Batch search: load, index, then score every query on a worker pool.
//!
//! Loading and index construction are single-threaded. Scoring runs on a
//! rayon pool of `cores` threads; each worker sends its finished
//! [`QueryOutcome`] over an mpsc channel to the calling thread, which is the
//! only one that talks to the [`SearchSink`] about results and progress.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use entropy_search_core::index::LibraryIndex;
use entropy_search_core::library::Library;
use entropy_search_core::models::{SearchMode, Spectrum};
use entropy_search_core::search::{search_query_with, QueryOutcome, SearchParams};
use entropy_search_core::similarity::{EntropySimilarity, Scorer, ScoringStrategy};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::formats::{self, LoadOptions};
use crate::progress::{SearchProgressEvent, SearchProgressReporter};

/// Everything needed to run one search.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub file_query: PathBuf,
    pub file_library: PathBuf,
    /// Non-zero overrides the charge of every query.
    pub charge: i32,
    pub params: SearchParams,
    pub cores: usize,
    pub load: LoadOptions,
    /// Load the library through its `.esi` sidecar cache.
    pub cache_library: bool,
    pub strategy: Arc<dyn ScoringStrategy>,
}

impl SearchRequest {
    /// A request with entropy similarity, one worker and default loading.
    pub fn new(file_query: PathBuf, file_library: PathBuf, params: SearchParams) -> Self {
        Self {
            file_query,
            file_library,
            charge: 0,
            params,
            cores: 1,
            load: LoadOptions::default(),
            cache_library: false,
            strategy: Arc::new(EntropySimilarity),
        }
    }
}

/// Query spectra of a run with a scan lookup table.
#[derive(Debug)]
pub struct QuerySet {
    pub spectra: Vec<Spectrum>,
    by_scan: HashMap<u32, usize>,
}

impl QuerySet {
    pub fn new(spectra: Vec<Spectrum>) -> Self {
        let mut by_scan = HashMap::with_capacity(spectra.len());
        for (i, s) in spectra.iter().enumerate() {
            by_scan.entry(s.scan()).or_insert(i);
        }
        Self { spectra, by_scan }
    }

    pub fn get(&self, scan: u32) -> Option<&Spectrum> {
        self.by_scan.get(&scan).map(|&i| &self.spectra[i])
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

/// Loaded and indexed inputs of a run, shared read-only with the workers
/// and the HTTP layer.
#[derive(Debug)]
pub struct SearchContext {
    pub queries: QuerySet,
    pub library: Library,
    pub index: LibraryIndex,
    pub charge: i32,
    pub params: SearchParams,
    pub scorer: Scorer<Arc<dyn ScoringStrategy>>,
}

impl SearchContext {
    pub fn search(&self, query: &Spectrum) -> anyhow::Result<QueryOutcome> {
        search_query_with(
            query,
            self.charge,
            &self.library,
            &self.index,
            &self.params,
            &self.scorer,
        )
    }

    /// Hits of `outcome` per mode, joined with the library spectra they
    /// point at. Every mode is present, possibly with an empty list.
    pub fn library_hits(&self, outcome: Option<&QueryOutcome>) -> BTreeMap<&'static str, Vec<LibraryHit>> {
        SearchMode::ALL
            .iter()
            .map(|&mode| {
                let hits = outcome
                    .map(|o| o.hits(mode))
                    .unwrap_or(&[])
                    .iter()
                    .filter_map(|m| {
                        let entry = self.library.get(m.library_ref)?;
                        Some(LibraryHit {
                            library_id: entry.spectrum.id().to_string(),
                            library_name: entry.spectrum.name().map(str::to_string),
                            library_precursor_type: entry
                                .spectrum
                                .precursor_type()
                                .map(str::to_string),
                            library_idx: m.library_ref.idx,
                            charge: m.library_ref.charge,
                            precursor_mz: m.precursor_mz,
                            score: m.score,
                            delta_mz: m.delta_mz,
                            matched_peaks: m.matched_peaks,
                        })
                    })
                    .collect();
                (mode.as_str(), hits)
            })
            .collect()
    }
}

/// A ranked library hit with the library spectrum's identifying fields.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryHit {
    #[serde(rename = "library-id")]
    pub library_id: String,
    #[serde(rename = "library-name")]
    pub library_name: Option<String>,
    #[serde(rename = "library-precursor_type")]
    pub library_precursor_type: Option<String>,
    #[serde(rename = "library-idx")]
    pub library_idx: usize,
    pub charge: i32,
    pub precursor_mz: f64,
    pub score: f64,
    pub delta_mz: f64,
    pub matched_peaks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Queries processed, including skipped and failed ones.
    pub searched: usize,
    /// Queries skipped for lack of a charge.
    pub skipped: usize,
    /// Queries that failed with an internal error.
    pub failed: usize,
    /// The run stopped early because the sink was cancelled.
    pub cancelled: bool,
}

impl RunSummary {
    pub fn finished_event(&self) -> SearchProgressEvent {
        SearchProgressEvent::Finished {
            searched: self.searched as u64,
            skipped: self.skipped as u64,
            failed: self.failed as u64,
        }
    }
}

/// Receives the inputs, progress and results of a run.
pub trait SearchSink: Send + Sync {
    /// Called once the query and library files are loaded and indexed.
    fn on_inputs(&self, _context: Arc<SearchContext>) {}

    fn on_progress(&self, _event: &SearchProgressEvent) {}

    /// A query finished. Outcomes are published whole and never revised.
    fn publish(&self, outcome: QueryOutcome);

    /// A query failed with an internal error and will not be published.
    fn on_failure(&self, _scan: u32, _error: &SearchError) {}

    /// Checked by workers before each query.
    fn is_cancelled(&self) -> bool {
        false
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn emit(reporter: &dyn SearchProgressReporter, sink: &dyn SearchSink, event: SearchProgressEvent) {
    sink.on_progress(&event);
    reporter.report(event);
}

/// Run `request` to completion.
pub fn run(
    request: &SearchRequest,
    reporter: &dyn SearchProgressReporter,
    sink: &dyn SearchSink,
) -> Result<RunSummary, SearchError> {
    emit(
        reporter,
        sink,
        SearchProgressEvent::Loading {
            file: format!("query {}", file_label(&request.file_query)),
        },
    );
    let queries = formats::load(&request.file_query, &request.load)?;

    emit(
        reporter,
        sink,
        SearchProgressEvent::Loading {
            file: format!("library {}", file_label(&request.file_library)),
        },
    );
    let library_spectra = if request.cache_library {
        formats::load_cached(&request.file_library, &request.load)?
    } else {
        formats::load(&request.file_library, &request.load)?
    };
    let from_cache = library_spectra.from_cache;
    if queries.skipped + library_spectra.skipped > 0 {
        warn!(
            query_skipped = queries.skipped,
            library_skipped = library_spectra.skipped,
            "skipped malformed records"
        );
    }

    emit(
        reporter,
        sink,
        SearchProgressEvent::Indexing {
            spectra: library_spectra.spectra.len() as u64,
        },
    );
    let params = request.params.clone();
    let library = Library::build(library_spectra.spectra, &params.cleaning);
    let index = LibraryIndex::build(&library, params.ms1_tolerance, params.ms2_tolerance);
    let scorer = Scorer::with_strategy(
        Arc::clone(&request.strategy),
        params.ms1_tolerance,
        params.ms2_tolerance,
    );
    let context = Arc::new(SearchContext {
        queries: QuerySet::new(queries.spectra),
        library,
        index,
        charge: request.charge,
        params,
        scorer,
    });
    info!(
        queries = context.queries.len(),
        library = context.library.len(),
        cached = from_cache,
        partitions = ?context.library.charge_counts(),
        strategy = context.scorer.strategy().name(),
        "search inputs ready"
    );
    sink.on_inputs(Arc::clone(&context));

    let total = context.queries.len();
    let mut summary = RunSummary::default();
    if total == 0 {
        emit(reporter, sink, summary.finished_event());
        return Ok(summary);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(request.cores.max(1))
        .build()
        .map_err(|e| SearchError::Internal(format!("failed to build worker pool: {}", e)))?;

    let report_every = (total / 100).max(1);
    let (tx, rx) = mpsc::channel::<(u32, anyhow::Result<QueryOutcome>)>();

    std::thread::scope(|scope| {
        let context = &context;
        scope.spawn(move || {
            pool.install(|| {
                context.queries.spectra.par_iter().for_each_with(tx, |tx, query| {
                    if sink.is_cancelled() {
                        return;
                    }
                    let _ = tx.send((query.scan(), context.search(query)));
                });
            });
        });

        for (scan, result) in rx {
            summary.searched += 1;
            match result {
                Ok(outcome) => {
                    if outcome.skipped.is_some() {
                        summary.skipped += 1;
                        debug!(scan, "query skipped: unknown charge");
                    }
                    sink.publish(outcome);
                }
                Err(e) => {
                    summary.failed += 1;
                    let err = SearchError::Internal(e.to_string());
                    warn!(scan, "query failed, continuing: {}", err);
                    sink.on_failure(scan, &err);
                }
            }

            let event = SearchProgressEvent::Searching {
                n: summary.searched as u64,
                total: total as u64,
            };
            sink.on_progress(&event);
            if summary.searched % report_every == 0 || summary.searched == total {
                reporter.report(event);
            }
        }
    });

    if sink.is_cancelled() {
        summary.cancelled = true;
        return Ok(summary);
    }

    emit(reporter, sink, summary.finished_event());
    Ok(summary)
}
