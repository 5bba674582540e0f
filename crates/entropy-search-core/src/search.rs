//! Per-query search across the four modes.
//!
//! [`search_query`] works entirely on an already built [`Library`] and
//! [`LibraryIndex`]; it does no I/O and holds no locks, so the caller is
//! free to fan queries out over a thread pool.
//!
//! # Algorithm
//!
//! 1. Resolve the query charge (request override, spectrum, ion mode,
//!    adduct). Queries without a charge are skipped.
//! 2. Prepare the query peaks.
//! 3. Narrow candidates per mode: identity uses the precursor index, open
//!    uses fragment index hits, neutral loss uses loss index hits, hybrid
//!    uses the union of fragment and loss hits.
//! 4. Score candidates, keep `score > 0 && score >= score_min`.
//! 5. Sort by score (desc), matched peaks (desc), library idx (asc).
//! 6. Truncate to `top_n`.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::index::{LibraryIndex, PeakIndex};
use crate::library::{LibraryEntry, Library};
use crate::models::{LibraryRef, MatchResult, SearchMode, Spectrum};
use crate::peaks::{CleaningParams, PreparedSpectrum};
use crate::similarity::{ScoringStrategy, Scorer};

/// Search tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Precursor tolerance in Da, used by identity search.
    pub ms1_tolerance: f64,
    /// Fragment tolerance in Da, used by every mode.
    pub ms2_tolerance: f64,
    /// Maximum hits kept per mode.
    pub top_n: usize,
    /// Hits scoring below this are dropped.
    pub score_min: f64,
    /// Peak cleaning applied to query spectra.
    pub cleaning: CleaningParams,
}

impl SearchParams {
    pub fn new(ms1_tolerance: f64, ms2_tolerance: f64) -> Self {
        Self {
            ms1_tolerance,
            ms2_tolerance,
            top_n: 100,
            score_min: 0.0,
            cleaning: CleaningParams::for_tolerance(ms2_tolerance),
        }
    }
}

/// Why a query produced no results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnknownCharge,
}

impl SkipReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SkipReason::UnknownCharge => "unknown charge",
        }
    }
}

/// The full result for one query spectrum, published as a unit.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub scan: u32,
    /// Resolved charge, 0 when skipped.
    pub charge: i32,
    pub matches: BTreeMap<SearchMode, Vec<MatchResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

impl QueryOutcome {
    pub fn skipped(scan: u32, reason: SkipReason) -> Self {
        Self {
            scan,
            charge: 0,
            matches: empty_matches(),
            skipped: Some(reason),
        }
    }

    pub fn hits(&self, mode: SearchMode) -> &[MatchResult] {
        self.matches.get(&mode).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Score of the first hit in `mode`, 0.0 when there is none.
    pub fn best_score(&self, mode: SearchMode) -> f64 {
        self.hits(mode).first().map(|m| m.score).unwrap_or(0.0)
    }

    pub fn best_identity(&self) -> Option<&MatchResult> {
        self.hits(SearchMode::IdentitySearch).first()
    }
}

fn empty_matches() -> BTreeMap<SearchMode, Vec<MatchResult>> {
    SearchMode::ALL.iter().map(|&m| (m, Vec::new())).collect()
}

/// Charge used for a query: a non-zero override wins, then the spectrum's
/// own (possibly inferred) charge.
pub fn resolve_charge(query: &Spectrum, charge_override: i32) -> Option<i32> {
    if charge_override != 0 {
        return Some(charge_override);
    }
    query.resolved_charge().filter(|&c| c != 0)
}

/// Search one query spectrum against the library with entropy similarity.
pub fn search_query(
    query: &Spectrum,
    charge_override: i32,
    library: &Library,
    index: &LibraryIndex,
    params: &SearchParams,
) -> Result<QueryOutcome> {
    let scorer = Scorer::new(params.ms1_tolerance, params.ms2_tolerance);
    search_query_with(query, charge_override, library, index, params, &scorer)
}

/// Same as [`search_query`] with a caller-supplied scorer.
pub fn search_query_with<S: ScoringStrategy>(
    query: &Spectrum,
    charge_override: i32,
    library: &Library,
    index: &LibraryIndex,
    params: &SearchParams,
    scorer: &Scorer<S>,
) -> Result<QueryOutcome> {
    let Some(charge) = resolve_charge(query, charge_override) else {
        return Ok(QueryOutcome::skipped(query.scan(), SkipReason::UnknownCharge));
    };

    let mut outcome = QueryOutcome {
        scan: query.scan(),
        charge,
        matches: empty_matches(),
        skipped: None,
    };

    let (Some(entries), Some(partition)) = (library.partition(charge), index.partition(charge))
    else {
        return Ok(outcome);
    };

    let prepared = PreparedSpectrum::prepare(query, &params.cleaning);
    if prepared.is_empty() {
        return Ok(outcome);
    }
    let losses = prepared.neutral_loss();

    let identity = index
        .precursors()
        .query(charge, query.precursor_mz(), params.ms1_tolerance);
    let open = peak_candidates(&partition.fragments, &prepared, params.ms2_tolerance, entries.len());
    let neutral_loss = peak_candidates(&partition.losses, &losses, params.ms2_tolerance, entries.len());
    let hybrid = union(&open, &neutral_loss);

    let candidates = [
        (SearchMode::IdentitySearch, identity),
        (SearchMode::OpenSearch, open),
        (SearchMode::NeutralLossSearch, neutral_loss),
        (SearchMode::HybridSearch, hybrid),
    ];

    for (mode, idxs) in candidates {
        let mut hits = Vec::new();
        for idx in idxs {
            let Some(entry) = entries.get(idx) else {
                continue;
            };
            let score = scorer.score(mode, &prepared, &entry.prepared);
            if !score.value.is_finite() {
                bail!(
                    "non-finite {} score for scan {} against library {}/{}",
                    mode,
                    query.scan(),
                    charge,
                    idx
                );
            }
            if score.value > 0.0 && score.value >= params.score_min {
                hits.push(match_result(query, charge, entry, score.value, score.matched_peaks));
            }
        }
        rank(&mut hits, params.top_n);
        outcome.matches.insert(mode, hits);
    }

    Ok(outcome)
}

fn match_result(
    query: &Spectrum,
    charge: i32,
    entry: &LibraryEntry,
    score: f64,
    matched_peaks: usize,
) -> MatchResult {
    let library_mz = entry.spectrum.precursor_mz();
    MatchResult {
        library_ref: LibraryRef {
            charge,
            idx: entry.idx,
        },
        score,
        precursor_mz: library_mz,
        delta_mz: query.precursor_mz() - library_mz,
        matched_peaks,
    }
}

/// Distinct library idx values hit by any prepared peak, ascending.
fn peak_candidates(
    index: &PeakIndex,
    prepared: &PreparedSpectrum,
    tolerance: f64,
    partition_len: usize,
) -> Vec<usize> {
    let mut seen = vec![false; partition_len];
    for peak in &prepared.peaks {
        for hit in index.query(peak.mz, tolerance) {
            if let Some(flag) = seen.get_mut(hit.spectrum) {
                *flag = true;
            }
        }
    }
    seen.iter()
        .enumerate()
        .filter_map(|(idx, &hit)| hit.then_some(idx))
        .collect()
}

fn union(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut out: Vec<usize> = a.iter().chain(b.iter()).copied().collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Sort by score (desc), matched peaks (desc), library idx (asc), then
/// truncate to `top_n`.
pub fn rank(hits: &mut Vec<MatchResult>, top_n: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.matched_peaks.cmp(&a.matched_peaks))
            .then(a.library_ref.idx.cmp(&b.library_ref.idx))
    });
    hits.truncate(top_n);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{meta_keys, MetaValue, Peak};

    fn spectrum(scan: u32, precursor: f64, charge: i32, raw: &[(f64, f64)]) -> Spectrum {
        Spectrum::new(
            scan,
            precursor,
            raw.iter().map(|&(mz, i)| Peak::new(mz, i)).collect(),
        )
        .with_charge(charge)
    }

    fn setup(spectra: Vec<Spectrum>) -> (Library, LibraryIndex, SearchParams) {
        let params = SearchParams::new(0.01, 0.02);
        let library = Library::build(spectra, &params.cleaning);
        let index = LibraryIndex::build(&library, params.ms1_tolerance, params.ms2_tolerance);
        (library, index, params)
    }

    fn hit(idx: usize, score: f64, matched_peaks: usize) -> MatchResult {
        MatchResult {
            library_ref: LibraryRef { charge: 1, idx },
            score,
            precursor_mz: 0.0,
            delta_mz: 0.0,
            matched_peaks,
        }
    }

    #[test]
    fn test_self_match_ranks_first() {
        let (library, index, params) = setup(vec![
            spectrum(1, 250.0, 1, &[(100.0, 10.0), (120.0, 90.0)]),
            spectrum(2, 300.1, 1, &[(100.0, 50.0), (150.0, 100.0)]),
        ]);
        let query = spectrum(7, 300.1, 1, &[(100.0, 50.0), (150.0, 100.0)]);
        let outcome = search_query(&query, 0, &library, &index, &params).unwrap();

        assert_eq!(outcome.scan, 7);
        assert_eq!(outcome.charge, 1);
        let top = outcome.best_identity().unwrap();
        assert_eq!(top.library_ref, LibraryRef { charge: 1, idx: 1 });
        assert!((top.score - 1.0).abs() < 1e-9);
        assert_eq!(outcome.hits(SearchMode::IdentitySearch).len(), 1);
        assert!((outcome.best_score(SearchMode::OpenSearch) - 1.0).abs() < 1e-9);
        assert!((outcome.best_score(SearchMode::HybridSearch) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_identity_hits_stay_within_ms1_tolerance() {
        let (library, index, params) = setup(vec![
            spectrum(1, 300.0, 1, &[(100.0, 1.0), (150.0, 1.0)]),
            spectrum(2, 300.009, 1, &[(100.0, 1.0), (150.0, 1.0)]),
            spectrum(3, 300.2, 1, &[(100.0, 1.0), (150.0, 1.0)]),
        ]);
        let query = spectrum(1, 300.0, 1, &[(100.0, 1.0), (150.0, 1.0)]);
        let outcome = search_query(&query, 0, &library, &index, &params).unwrap();
        for m in outcome.hits(SearchMode::IdentitySearch) {
            assert!(m.delta_mz.abs() <= params.ms1_tolerance);
        }
        assert_eq!(outcome.hits(SearchMode::IdentitySearch).len(), 2);
        assert_eq!(outcome.hits(SearchMode::OpenSearch).len(), 3);
    }

    #[test]
    fn test_unknown_charge_is_skipped() {
        let (library, index, params) = setup(vec![spectrum(1, 300.0, 1, &[(100.0, 1.0)])]);
        let query = spectrum(4, 300.0, 0, &[(100.0, 1.0)]);
        let outcome = search_query(&query, 0, &library, &index, &params).unwrap();
        assert_eq!(outcome.skipped, Some(SkipReason::UnknownCharge));
        assert!(SearchMode::ALL.iter().all(|&m| outcome.hits(m).is_empty()));
    }

    #[test]
    fn test_charge_override_and_inference() {
        let (library, index, params) = setup(vec![spectrum(1, 300.0, -1, &[(100.0, 1.0)])]);
        let plain = spectrum(1, 300.0, 0, &[(100.0, 1.0)]);
        let overridden = search_query(&plain, -1, &library, &index, &params).unwrap();
        assert_eq!(overridden.charge, -1);
        assert_eq!(overridden.hits(SearchMode::IdentitySearch).len(), 1);

        let negative = plain
            .clone()
            .with_metadata(meta_keys::ION_MODE, MetaValue::from_text("Negative"));
        let inferred = search_query(&negative, 0, &library, &index, &params).unwrap();
        assert_eq!(inferred.charge, -1);
        assert!(inferred.skipped.is_none());
    }

    #[test]
    fn test_missing_partition_gives_empty_lists() {
        let (library, index, params) = setup(vec![spectrum(1, 300.0, 1, &[(100.0, 1.0)])]);
        let query = spectrum(1, 300.0, 2, &[(100.0, 1.0)]);
        let outcome = search_query(&query, 0, &library, &index, &params).unwrap();
        assert!(outcome.skipped.is_none());
        assert_eq!(outcome.matches.len(), 4);
        assert!(SearchMode::ALL.iter().all(|&m| outcome.hits(m).is_empty()));
    }

    #[test]
    fn test_top_n_and_score_min() {
        let spectra: Vec<Spectrum> = (0..5)
            .map(|i| spectrum(i + 1, 300.0, 1, &[(100.0, 1.0), (150.0 + i as f64, 1.0)]))
            .collect();
        let (library, index, mut params) = setup(spectra);
        params.top_n = 2;
        let query = spectrum(1, 300.0, 1, &[(100.0, 1.0), (150.0, 1.0)]);
        let outcome = search_query(&query, 0, &library, &index, &params).unwrap();
        let open = outcome.hits(SearchMode::OpenSearch);
        assert_eq!(open.len(), 2);
        assert_eq!(open[0].library_ref.idx, 0);
        assert!(open.windows(2).all(|w| w[0].score >= w[1].score));

        params.top_n = 100;
        params.score_min = 0.99;
        let strict = search_query(&query, 0, &library, &index, &params).unwrap();
        assert_eq!(strict.hits(SearchMode::OpenSearch).len(), 1);
    }

    #[test]
    fn test_rank_tie_breaks() {
        let mut hits = vec![hit(3, 0.5, 2), hit(1, 0.9, 1), hit(0, 0.5, 2), hit(2, 0.5, 4)];
        rank(&mut hits, 3);
        let order: Vec<usize> = hits.iter().map(|h| h.library_ref.idx).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_empty_query_peaks() {
        let (library, index, params) = setup(vec![spectrum(1, 300.0, 1, &[(100.0, 1.0)])]);
        let query = spectrum(1, 100.0, 1, &[(150.0, 1.0)]);
        let outcome = search_query(&query, 0, &library, &index, &params).unwrap();
        assert!(SearchMode::ALL.iter().all(|&m| outcome.hits(m).is_empty()));
    }
}
