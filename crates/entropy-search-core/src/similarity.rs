//! Entropy similarity scoring for the four search modes.
//!
//! Both spectra are first turned into [`PreparedSpectrum`]s, then their peaks
//! are paired up and the paired intensity vectors are handed to a
//! [`ScoringStrategy`]. The default strategy is [`EntropySimilarity`]:
//!
//! ```text
//! similarity = 1 - (2 * H((P + Q) / 2) - H(P) - H(Q)) / ln(4)
//! ```
//!
//! where `H` is natural-log Shannon entropy. Identical distributions score
//! 1.0, distributions with no shared peaks score 0.0.
//!
//! Peak pairing differs per mode:
//!
//! | Mode | Pairing |
//! |------|---------|
//! | identity | direct m/z, only when precursors agree within `ms1_tol` |
//! | open | direct m/z |
//! | neutral loss | direct m/z on loss-space copies |
//! | hybrid | each query peak direct or shifted by the precursor delta |

use std::fmt::Debug;
use std::sync::Arc;

use crate::models::{Peak, SearchMode, Spectrum};
use crate::peaks::{CleaningParams, PreparedSpectrum};

/// A similarity formula over paired intensities.
///
/// Each slot of `pairs` holds `(query_intensity, library_intensity)`; a zero
/// on one side means the peak has no partner. Implementations must return a
/// value in `[0.0, 1.0]` for valid inputs.
pub trait ScoringStrategy: Debug + Send + Sync {
    fn name(&self) -> &str;
    fn similarity(&self, pairs: &[(f64, f64)]) -> f64;
}

impl<T: ScoringStrategy + ?Sized> ScoringStrategy for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn similarity(&self, pairs: &[(f64, f64)]) -> f64 {
        (**self).similarity(pairs)
    }
}

/// Spectral entropy similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntropySimilarity;

fn entropy_term(x: f64) -> f64 {
    if x > 0.0 {
        -x * x.ln()
    } else {
        0.0
    }
}

impl ScoringStrategy for EntropySimilarity {
    fn name(&self) -> &str {
        "entropy"
    }

    fn similarity(&self, pairs: &[(f64, f64)]) -> f64 {
        let sum_p: f64 = pairs.iter().map(|(p, _)| p).sum();
        let sum_q: f64 = pairs.iter().map(|(_, q)| q).sum();
        if sum_p <= 0.0 || sum_q <= 0.0 {
            return 0.0;
        }

        let mut h_p = 0.0;
        let mut h_q = 0.0;
        let mut h_m = 0.0;
        for &(p, q) in pairs {
            let p = p / sum_p;
            let q = q / sum_q;
            h_p += entropy_term(p);
            h_q += entropy_term(q);
            h_m += entropy_term((p + q) / 2.0);
        }

        let similarity = 1.0 - (2.0 * h_m - h_p - h_q) / 4.0_f64.ln();
        if similarity.is_nan() {
            return similarity;
        }
        similarity.clamp(0.0, 1.0)
    }
}

/// Outcome of scoring a single pair of spectra.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub value: f64,
    pub matched_peaks: usize,
}

impl Score {
    pub const ZERO: Score = Score {
        value: 0.0,
        matched_peaks: 0,
    };
}

/// Pairs peaks of two sorted spectra within `tolerance`.
///
/// Library peaks within tolerance of a query peak are summed onto that
/// query peak's slot; unmatched peaks on either side get their own slot
/// with a zero partner.
pub fn match_peaks(query: &[Peak], library: &[Peak], tolerance: f64) -> (Vec<(f64, f64)>, usize) {
    let mut pairs = Vec::with_capacity(query.len() + library.len());
    let mut matched = 0;
    let mut a = 0;
    let mut b = 0;
    let mut current: Option<(f64, f64)> = None;

    while a < query.len() && b < library.len() {
        let diff = query[a].mz - library[b].mz;
        if diff < -tolerance {
            pairs.push(current.take().unwrap_or((query[a].intensity, 0.0)));
            a += 1;
        } else if diff > tolerance {
            pairs.push((0.0, library[b].intensity));
            b += 1;
        } else {
            let slot = current.get_or_insert((query[a].intensity, 0.0));
            if slot.1 == 0.0 {
                matched += 1;
            }
            slot.1 += library[b].intensity;
            b += 1;
        }
    }

    if a < query.len() {
        pairs.push(current.take().unwrap_or((query[a].intensity, 0.0)));
        a += 1;
        pairs.extend(query[a..].iter().map(|p| (p.intensity, 0.0)));
    }
    pairs.extend(library[b..].iter().map(|p| (0.0, p.intensity)));

    (pairs, matched)
}

/// Index of the most intense library peak within `tolerance` of `mz`.
fn most_intense_within(library: &[Peak], mz: f64, tolerance: f64) -> Option<usize> {
    let start = library.partition_point(|p| p.mz < mz - tolerance);
    library[start..]
        .iter()
        .take_while(|p| p.mz <= mz + tolerance)
        .enumerate()
        .max_by(|(_, x), (_, y)| x.intensity.total_cmp(&y.intensity))
        .map(|(offset, _)| start + offset)
}

/// Scores prepared spectra under a [`SearchMode`].
#[derive(Debug, Clone)]
pub struct Scorer<S: ScoringStrategy = EntropySimilarity> {
    strategy: S,
    ms1_tolerance: f64,
    ms2_tolerance: f64,
}

impl Scorer<EntropySimilarity> {
    pub fn new(ms1_tolerance: f64, ms2_tolerance: f64) -> Self {
        Self::with_strategy(EntropySimilarity, ms1_tolerance, ms2_tolerance)
    }
}

impl<S: ScoringStrategy> Scorer<S> {
    pub fn with_strategy(strategy: S, ms1_tolerance: f64, ms2_tolerance: f64) -> Self {
        Self {
            strategy,
            ms1_tolerance,
            ms2_tolerance,
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn score(&self, mode: SearchMode, query: &PreparedSpectrum, library: &PreparedSpectrum) -> Score {
        if query.is_empty() || library.is_empty() {
            return Score::ZERO;
        }
        match mode {
            SearchMode::IdentitySearch => self.identity(query, library),
            SearchMode::OpenSearch => self.direct(&query.peaks, &library.peaks),
            SearchMode::NeutralLossSearch => self.neutral_loss(query, library),
            SearchMode::HybridSearch => self.hybrid(query, library),
        }
    }

    fn identity(&self, query: &PreparedSpectrum, library: &PreparedSpectrum) -> Score {
        if (query.precursor_mz - library.precursor_mz).abs() > self.ms1_tolerance {
            return Score::ZERO;
        }
        self.direct(&query.peaks, &library.peaks)
    }

    fn neutral_loss(&self, query: &PreparedSpectrum, library: &PreparedSpectrum) -> Score {
        self.direct(&query.neutral_loss().peaks, &library.neutral_loss().peaks)
    }

    fn direct(&self, query: &[Peak], library: &[Peak]) -> Score {
        let (pairs, matched_peaks) = match_peaks(query, library, self.ms2_tolerance);
        if matched_peaks == 0 {
            return Score::ZERO;
        }
        Score {
            value: self.strategy.similarity(&pairs),
            matched_peaks,
        }
    }

    fn hybrid(&self, query: &PreparedSpectrum, library: &PreparedSpectrum) -> Score {
        let delta = query.precursor_mz - library.precursor_mz;
        let lib = &library.peaks;

        let mut query_unmatched: Vec<f64> = query.peaks.iter().map(|p| p.intensity).collect();
        let mut moved = vec![0.0; lib.len()];
        let mut matched_peaks = 0;

        for (i, peak) in query.peaks.iter().enumerate() {
            let direct = most_intense_within(lib, peak.mz, self.ms2_tolerance);
            let shifted = most_intense_within(lib, peak.mz - delta, self.ms2_tolerance);
            let target = match (direct, shifted) {
                (Some(d), Some(s)) if lib[s].intensity > lib[d].intensity => Some(s),
                (Some(d), _) => Some(d),
                (None, s) => s,
            };
            if let Some(j) = target {
                moved[j] += query_unmatched[i];
                query_unmatched[i] = 0.0;
                matched_peaks += 1;
            }
        }

        if matched_peaks == 0 {
            return Score::ZERO;
        }

        let pairs: Vec<(f64, f64)> = query_unmatched
            .into_iter()
            .map(|p| (p, 0.0))
            .chain(moved.into_iter().zip(lib.iter().map(|p| p.intensity)))
            .collect();

        Score {
            value: self.strategy.similarity(&pairs),
            matched_peaks,
        }
    }
}

/// Similarity of two raw spectra under `mode`, using default cleaning.
pub fn score(
    query: &Spectrum,
    candidate: &Spectrum,
    mode: SearchMode,
    ms1_tolerance: f64,
    ms2_tolerance: f64,
) -> f64 {
    let params = CleaningParams::for_tolerance(ms2_tolerance);
    let q = PreparedSpectrum::prepare(query, &params);
    let c = PreparedSpectrum::prepare(candidate, &params);
    Scorer::new(ms1_tolerance, ms2_tolerance)
        .score(mode, &q, &c)
        .value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum(precursor: f64, raw: &[(f64, f64)]) -> Spectrum {
        Spectrum::new(
            1,
            precursor,
            raw.iter().map(|&(mz, i)| Peak::new(mz, i)).collect(),
        )
    }

    #[test]
    fn test_self_match_scores_one_in_every_mode() {
        let s = spectrum(300.1, &[(100.0, 50.0), (150.0, 100.0)]);
        for mode in SearchMode::ALL {
            let value = score(&s, &s, mode, 0.01, 0.02);
            assert!((value - 1.0).abs() < 1e-9, "{} scored {}", mode, value);
        }
    }

    #[test]
    fn test_disjoint_spectra_score_zero() {
        let a = spectrum(300.0, &[(100.0, 1.0), (110.0, 1.0)]);
        let b = spectrum(300.0, &[(200.0, 1.0), (210.0, 1.0)]);
        assert_eq!(score(&a, &b, SearchMode::OpenSearch, 0.01, 0.02), 0.0);
    }

    #[test]
    fn test_identity_requires_precursor_match() {
        let a = spectrum(300.0, &[(100.0, 1.0), (150.0, 2.0)]);
        let b = spectrum(300.5, &[(100.0, 1.0), (150.0, 2.0)]);
        assert_eq!(score(&a, &b, SearchMode::IdentitySearch, 0.01, 0.02), 0.0);
        assert!(score(&a, &b, SearchMode::OpenSearch, 0.01, 0.02) > 0.99);
    }

    #[test]
    fn test_direct_modes_are_symmetric() {
        let a = spectrum(300.0, &[(80.0, 10.0), (100.0, 30.0), (150.0, 60.0)]);
        let b = spectrum(300.005, &[(100.0, 50.0), (150.0, 20.0), (200.0, 30.0)]);
        for mode in [SearchMode::IdentitySearch, SearchMode::OpenSearch] {
            let ab = score(&a, &b, mode, 0.01, 0.02);
            let ba = score(&b, &a, mode, 0.01, 0.02);
            assert!((ab - ba).abs() < 1e-12);
            assert!(ab > 0.0 && ab < 1.0);
        }
    }

    #[test]
    fn test_neutral_loss_equals_identity_on_loss_space() {
        let params = CleaningParams::for_tolerance(0.02);
        let q = PreparedSpectrum::prepare(
            &spectrum(300.0, &[(100.0, 10.0), (180.0, 40.0), (250.0, 50.0)]),
            &params,
        );
        let l = PreparedSpectrum::prepare(
            &spectrum(330.0, &[(130.0, 20.0), (210.0, 40.0), (260.0, 40.0)]),
            &params,
        );
        let scorer = Scorer::new(100.0, 0.02);
        let nl = scorer.score(SearchMode::NeutralLossSearch, &q, &l);
        let id = scorer.score(SearchMode::IdentitySearch, &q.neutral_loss(), &l.neutral_loss());
        assert_eq!(nl, id);
        assert!(nl.value > 0.0);
    }

    #[test]
    fn test_hybrid_matches_shifted_peaks() {
        // Library is the query shifted by +30 Da on both precursor and fragments.
        let q = spectrum(300.0, &[(100.0, 50.0), (150.0, 100.0)]);
        let l = spectrum(330.0, &[(130.0, 50.0), (180.0, 100.0)]);
        assert_eq!(score(&q, &l, SearchMode::OpenSearch, 0.01, 0.02), 0.0);
        let hybrid = score(&q, &l, SearchMode::HybridSearch, 0.01, 0.02);
        assert!((hybrid - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_match_peaks_sums_library_peaks_in_window() {
        let q = vec![Peak::new(100.0, 0.5), Peak::new(200.0, 0.5)];
        let l = vec![Peak::new(99.99, 0.2), Peak::new(100.01, 0.3), Peak::new(300.0, 0.5)];
        let (pairs, matched) = match_peaks(&q, &l, 0.02);
        assert_eq!(matched, 1);
        assert_eq!(pairs.len(), 3);
        assert!((pairs[0].0 - 0.5).abs() < 1e-12);
        assert!((pairs[0].1 - 0.5).abs() < 1e-12);
        assert_eq!(pairs[1], (0.5, 0.0));
        assert_eq!(pairs[2], (0.0, 0.5));
    }

    #[test]
    fn test_shared_strategy_scores_like_the_concrete_one() {
        let shared: Arc<dyn ScoringStrategy> = Arc::new(EntropySimilarity);
        let scorer = Scorer::with_strategy(shared, 0.01, 0.02);
        assert_eq!(scorer.strategy().name(), "entropy");

        let params = CleaningParams::for_tolerance(0.02);
        let a = PreparedSpectrum::prepare(&spectrum(300.0, &[(100.0, 1.0), (150.0, 2.0)]), &params);
        let b = PreparedSpectrum::prepare(&spectrum(300.0, &[(100.0, 2.0), (150.0, 1.0)]), &params);
        let concrete = Scorer::new(0.01, 0.02);
        for mode in SearchMode::ALL {
            assert_eq!(scorer.score(mode, &a, &b), concrete.score(mode, &a, &b));
        }
    }

    #[test]
    fn test_scores_stay_in_unit_interval() {
        let a = spectrum(500.0, &[(50.0, 3.0), (75.0, 1.0), (120.0, 9.0), (300.0, 2.0)]);
        let b = spectrum(480.0, &[(50.01, 1.0), (120.0, 2.0), (280.0, 9.0), (310.0, 5.0)]);
        for mode in SearchMode::ALL {
            let value = score(&a, &b, mode, 0.01, 0.02);
            assert!((0.0..=1.0).contains(&value), "{} out of range: {}", mode, value);
        }
    }
}
