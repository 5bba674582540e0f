//! Peak normalization and spectrum preparation.
//!
//! Two levels of processing exist:
//!
//! - [`normalize_peaks`] runs on every parsed spectrum. It only sorts,
//!   merges exact duplicates, and drops invalid values, so the stored peak
//!   list stays faithful to the input file.
//! - [`PreparedSpectrum::prepare`] runs before scoring. It removes the
//!   precursor region, centroids close peaks, drops noise, normalizes the
//!   intensities to a distribution and applies entropy weighting.
//!
//! # Entropy weighting
//!
//! Low-entropy spectra are dominated by a handful of peaks. When the
//! spectral entropy `S` is below 3, every intensity is raised to the power
//! `0.25 + 0.25 * S` and the distribution is renormalized, which lifts the
//! minor peaks before similarity is computed.

use crate::models::{Peak, Spectrum};

/// Spectral entropy at or above which no weighting is applied.
pub const WEIGHT_ENTROPY_CUTOFF: f64 = 3.0;

/// Sort by m/z, merge identical m/z values and drop invalid peaks.
pub fn normalize_peaks(mut peaks: Vec<Peak>) -> Vec<Peak> {
    peaks.retain(|p| {
        p.mz.is_finite() && p.mz > 0.0 && p.intensity.is_finite() && p.intensity > 0.0
    });
    peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));

    let mut merged: Vec<Peak> = Vec::with_capacity(peaks.len());
    for p in peaks {
        match merged.last_mut() {
            Some(last) if last.mz == p.mz => last.intensity += p.intensity,
            _ => merged.push(p),
        }
    }
    merged
}

/// Parameters for [`PreparedSpectrum::prepare`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleaningParams {
    /// Peaks at or above `precursor_mz - precursor_removal_da` are removed.
    pub precursor_removal_da: f64,
    /// Peaks at or below `noise_threshold * max_intensity` are removed.
    pub noise_threshold: f64,
    /// Peaks closer than this are centroided together.
    pub min_peak_distance: f64,
}

impl CleaningParams {
    pub const DEFAULT_PRECURSOR_REMOVAL_DA: f64 = 1.6;
    pub const DEFAULT_NOISE_THRESHOLD: f64 = 0.01;

    /// Default cleaning for a given MS2 tolerance (`min_peak_distance = 2 * ms2_tol`).
    pub fn for_tolerance(ms2_tolerance: f64) -> Self {
        Self {
            precursor_removal_da: Self::DEFAULT_PRECURSOR_REMOVAL_DA,
            noise_threshold: Self::DEFAULT_NOISE_THRESHOLD,
            min_peak_distance: 2.0 * ms2_tolerance,
        }
    }
}

/// Merge peaks that lie within `min_distance` of each other.
///
/// The most intense remaining peak absorbs every neighbour within the
/// distance; the merged m/z is intensity-weighted. Input must be sorted by
/// m/z; the output is sorted by m/z.
pub fn centroid(peaks: &[Peak], min_distance: f64) -> Vec<Peak> {
    let already_centroided = peaks
        .windows(2)
        .all(|w| w[1].mz - w[0].mz > min_distance);
    if already_centroided {
        return peaks.to_vec();
    }

    let mut remaining: Vec<Peak> = peaks.to_vec();
    let mut order: Vec<usize> = (0..remaining.len()).collect();
    order.sort_by(|&a, &b| peaks[b].intensity.total_cmp(&peaks[a].intensity));

    let mut result = Vec::with_capacity(peaks.len());
    for i in order {
        if remaining[i].intensity <= 0.0 {
            continue;
        }
        let center = remaining[i].mz;
        let mut left = i;
        while left > 0 && center - remaining[left - 1].mz <= min_distance {
            left -= 1;
        }
        let mut right = i + 1;
        while right < remaining.len() && remaining[right].mz - center <= min_distance {
            right += 1;
        }

        let mut total = 0.0;
        let mut weighted = 0.0;
        for p in &mut remaining[left..right] {
            total += p.intensity;
            weighted += p.mz * p.intensity;
            p.intensity = 0.0;
        }
        result.push(Peak::new(weighted / total, total));
    }

    result.sort_by(|a, b| a.mz.total_cmp(&b.mz));
    result
}

/// Natural-log Shannon entropy of the intensity distribution.
pub fn spectral_entropy(peaks: &[Peak]) -> f64 {
    let total: f64 = peaks.iter().map(|p| p.intensity).sum();
    if total <= 0.0 {
        return 0.0;
    }
    peaks
        .iter()
        .map(|p| p.intensity / total)
        .filter(|&x| x > 0.0)
        .map(|x| -x * x.ln())
        .sum()
}

fn normalize_sum(peaks: &mut [Peak]) {
    let total: f64 = peaks.iter().map(|p| p.intensity).sum();
    if total > 0.0 {
        for p in peaks.iter_mut() {
            p.intensity /= total;
        }
    }
}

/// Apply entropy weighting in place. Intensities must already sum to 1.
pub fn apply_entropy_weight(peaks: &mut [Peak]) {
    let entropy = spectral_entropy(peaks);
    if entropy < WEIGHT_ENTROPY_CUTOFF {
        let weight = 0.25 + 0.25 * entropy;
        for p in peaks.iter_mut() {
            p.intensity = p.intensity.powf(weight);
        }
        normalize_sum(peaks);
    }
}

/// Peak list ready for similarity scoring: cleaned, weighted and summing to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSpectrum {
    pub precursor_mz: f64,
    pub peaks: Vec<Peak>,
}

impl PreparedSpectrum {
    pub fn prepare(spectrum: &Spectrum, params: &CleaningParams) -> Self {
        Self::from_peaks(spectrum.precursor_mz(), spectrum.peaks(), params)
    }

    /// Prepare a raw peak list. `peaks` must be sorted by m/z.
    pub fn from_peaks(precursor_mz: f64, peaks: &[Peak], params: &CleaningParams) -> Self {
        let upper = precursor_mz - params.precursor_removal_da;
        let kept: Vec<Peak> = peaks
            .iter()
            .copied()
            .filter(|p| p.mz > 0.0 && p.mz < upper && p.intensity > 0.0)
            .collect();

        let mut peaks = centroid(&kept, params.min_peak_distance);

        let max = peaks.iter().map(|p| p.intensity).fold(0.0_f64, f64::max);
        let floor = max * params.noise_threshold;
        peaks.retain(|p| p.intensity > floor);

        normalize_sum(&mut peaks);
        apply_entropy_weight(&mut peaks);

        Self { precursor_mz, peaks }
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Loss-space copy: every peak becomes `precursor_mz - mz`, re-sorted.
    ///
    /// Intensities are carried over unchanged, so the distribution still
    /// sums to 1.
    pub fn neutral_loss(&self) -> Self {
        let mut peaks: Vec<Peak> = self
            .peaks
            .iter()
            .map(|p| Peak::new(self.precursor_mz - p.mz, p.intensity))
            .collect();
        peaks.sort_by(|a, b| a.mz.total_cmp(&b.mz));
        Self {
            precursor_mz: self.precursor_mz,
            peaks,
        }
    }
}
