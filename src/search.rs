//! `search` command: run one batch synchronously from the terminal.
//!
//! Progress goes to stderr through the selected reporter; results go to
//! stdout as text or as a JSON array (one object per query, in scan order).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use entropy_search_core::models::SearchMode;
use entropy_search_core::search::QueryOutcome;
use serde::Serialize;

use crate::config::{validate_ranking, validate_tolerances, Config};
use crate::formats::LoadOptions;
use crate::orchestrator::{self, LibraryHit, SearchContext, SearchRequest, SearchSink};
use crate::progress::SearchProgressReporter;

/// Command-line overrides for one search. `None` falls back to `[search]`.
#[derive(Debug, Clone, Default)]
pub struct SearchArgs {
    pub query: PathBuf,
    pub library: PathBuf,
    pub charge: i32,
    pub ms1_tolerance: Option<f64>,
    pub ms2_tolerance: Option<f64>,
    pub top_n: Option<usize>,
    pub score_min: Option<f64>,
    pub cores: Option<usize>,
}

/// Keeps every published outcome for printing at the end.
#[derive(Default)]
struct Collected {
    context: Mutex<Option<Arc<SearchContext>>>,
    outcomes: Mutex<BTreeMap<u32, QueryOutcome>>,
}

impl SearchSink for Collected {
    fn on_inputs(&self, context: Arc<SearchContext>) {
        if let Ok(mut slot) = self.context.lock() {
            *slot = Some(context);
        }
    }

    fn publish(&self, outcome: QueryOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.insert(outcome.scan, outcome);
        }
    }
}

#[derive(Serialize)]
struct QueryReport {
    scan: u32,
    name: Option<String>,
    precursor_mz: f64,
    charge: i32,
    skipped: Option<String>,
    #[serde(flatten)]
    hits: BTreeMap<&'static str, Vec<LibraryHit>>,
}

pub fn build_request(config: &Config, args: &SearchArgs) -> Result<SearchRequest> {
    let search = &config.search;
    let ms1 = args.ms1_tolerance.unwrap_or(search.ms1_tolerance_in_da);
    let ms2 = args.ms2_tolerance.unwrap_or(search.ms2_tolerance_in_da);
    let top_n = args.top_n.unwrap_or(search.top_n);
    let score_min = args.score_min.unwrap_or(search.score_min);
    let cores = args.cores.unwrap_or(search.cores);

    validate_tolerances(ms1, ms2)?;
    validate_ranking(top_n, score_min)?;
    if cores == 0 {
        bail!("cores must be >= 1");
    }

    Ok(SearchRequest {
        charge: args.charge,
        cores,
        load: LoadOptions {
            skip_invalid: config.preprocess.skip_invalid_records,
        },
        cache_library: config.preprocess.cache_library,
        ..SearchRequest::new(
            args.query.clone(),
            args.library.clone(),
            config.search_params(ms1, ms2, top_n, score_min),
        )
    })
}

pub fn run_search(
    config: &Config,
    args: &SearchArgs,
    json: bool,
    reporter: &dyn SearchProgressReporter,
) -> Result<()> {
    let request = build_request(config, args)?;
    let sink = Collected::default();
    let summary = orchestrator::run(&request, reporter, &sink)?;

    let context = sink
        .context
        .into_inner()
        .map_err(|_| anyhow::anyhow!("result collector poisoned"))?;
    let outcomes = sink
        .outcomes
        .into_inner()
        .map_err(|_| anyhow::anyhow!("result collector poisoned"))?;

    let Some(context) = context else {
        bail!("search finished without loading inputs");
    };

    let reports: Vec<QueryReport> = context
        .queries
        .spectra
        .iter()
        .filter_map(|query| {
            let outcome = outcomes.get(&query.scan())?;
            Some(QueryReport {
                scan: query.scan(),
                name: query.name().map(str::to_string),
                precursor_mz: query.precursor_mz(),
                charge: outcome.charge,
                skipped: outcome.skipped.map(|r| r.describe().to_string()),
                hits: context.library_hits(Some(outcome)),
            })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for report in &reports {
        println!(
            "scan {} / {} (precursor {:.4}, charge {})",
            report.scan,
            report.name.as_deref().unwrap_or("(unnamed)"),
            report.precursor_mz,
            report.charge
        );
        if let Some(reason) = &report.skipped {
            println!("    skipped: {}", reason);
            println!();
            continue;
        }
        for mode in SearchMode::ALL {
            match report.hits.get(mode.as_str()).and_then(|h| h.first()) {
                Some(hit) => println!(
                    "    {:<20} [{:.4}] {} {}",
                    mode.as_str(),
                    hit.score,
                    hit.library_name.as_deref().unwrap_or(&hit.library_id),
                    hit.library_precursor_type.as_deref().unwrap_or("")
                ),
                None => println!("    {:<20} no match", mode.as_str()),
            }
        }
        println!();
    }

    if summary.failed > 0 {
        eprintln!("{} spectra failed to score; see log for details", summary.failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use entropy_search_core::similarity::ScoringStrategy;

    #[test]
    fn request_uses_config_defaults() {
        let config = Config::default();
        let args = SearchArgs {
            query: PathBuf::from("q.mgf"),
            library: PathBuf::from("lib.msp"),
            top_n: Some(5),
            ..Default::default()
        };
        let request = build_request(&config, &args).unwrap();
        assert_eq!(request.params.ms1_tolerance, 0.01);
        assert_eq!(request.params.ms2_tolerance, 0.02);
        assert_eq!(request.params.top_n, 5);
        assert_eq!(request.cores, 1);
        assert_eq!(request.charge, 0);
        assert!(!request.cache_library);
        assert_eq!(request.strategy.name(), "entropy");
    }

    #[test]
    fn request_follows_preprocess_config() {
        let mut config = Config::default();
        config.preprocess.cache_library = true;
        config.preprocess.skip_invalid_records = true;
        let request = build_request(&config, &SearchArgs::default()).unwrap();
        assert!(request.cache_library);
        assert!(request.load.skip_invalid);
    }

    #[test]
    fn request_rejects_bad_overrides() {
        let config = Config::default();
        for args in [
            SearchArgs {
                ms1_tolerance: Some(0.0),
                ..Default::default()
            },
            SearchArgs {
                top_n: Some(0),
                ..Default::default()
            },
            SearchArgs {
                cores: Some(0),
                ..Default::default()
            },
        ] {
            assert!(build_request(&config, &args).is_err());
        }
    }
}
