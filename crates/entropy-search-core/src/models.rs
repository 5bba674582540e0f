//! Core data models used throughout Entropy Search.
//!
//! These types represent the spectra, library references and match results
//! that flow from the file readers through the index and scorer to the job
//! and HTTP layers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::peaks::normalize_peaks;

/// A single fragment peak.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Peak {
    pub mz: f64,
    pub intensity: f64,
}

impl Peak {
    pub fn new(mz: f64, intensity: f64) -> Self {
        Self { mz, intensity }
    }
}

/// A metadata value carried over from the input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(untagged)]
pub enum MetaValue {
    Number(f64),
    Text(String),
}

impl MetaValue {
    /// Numbers when the text parses as a finite float, text otherwise.
    pub fn from_text(value: &str) -> Self {
        match value.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => MetaValue::Number(n),
            _ => MetaValue::Text(value.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            MetaValue::Number(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetaValue::Number(n) => Some(*n),
            MetaValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Number(n) => write!(f, "{}", n),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

/// Canonical metadata keys written by the file readers.
pub mod meta_keys {
    pub const NAME: &str = "name";
    pub const PRECURSOR_TYPE: &str = "precursor_type";
    pub const ION_MODE: &str = "ion_mode";
    pub const SMILES: &str = "smiles";
}

/// A fragmentation (MS/MS) spectrum.
///
/// Peaks are normalized on construction: sorted ascending by m/z, exact
/// duplicate m/z values merged by summing intensity, and non-positive or
/// non-finite values dropped. The peak list cannot be mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Spectrum {
    id: String,
    scan: u32,
    precursor_mz: f64,
    charge: i32,
    retention_time: Option<f64>,
    peaks: Vec<Peak>,
    metadata: BTreeMap<String, MetaValue>,
}

impl Spectrum {
    pub fn new(scan: u32, precursor_mz: f64, peaks: Vec<Peak>) -> Self {
        Self {
            id: String::new(),
            scan,
            precursor_mz,
            charge: 0,
            retention_time: None,
            peaks: normalize_peaks(peaks),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_charge(mut self, charge: i32) -> Self {
        self.charge = charge;
        self
    }

    pub fn with_retention_time(mut self, rt: Option<f64>) -> Self {
        self.retention_time = rt;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: MetaValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_all_metadata(mut self, metadata: BTreeMap<String, MetaValue>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Re-applies peak normalization. Used after decoding from the binary
    /// library format, which bypasses [`Spectrum::new`].
    pub fn into_normalized(mut self) -> Self {
        self.peaks = normalize_peaks(std::mem::take(&mut self.peaks));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scan(&self) -> u32 {
        self.scan
    }

    pub fn precursor_mz(&self) -> f64 {
        self.precursor_mz
    }

    pub fn charge(&self) -> i32 {
        self.charge
    }

    pub fn retention_time(&self) -> Option<f64> {
        self.retention_time
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn metadata(&self) -> &BTreeMap<String, MetaValue> {
        &self.metadata
    }

    fn meta_text(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(MetaValue::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_text(meta_keys::NAME)
    }

    /// The adduct, e.g. `[M+H]+`.
    pub fn precursor_type(&self) -> Option<&str> {
        self.meta_text(meta_keys::PRECURSOR_TYPE)
    }

    pub fn ion_mode(&self) -> Option<&str> {
        self.meta_text(meta_keys::ION_MODE)
    }

    pub fn smiles(&self) -> Option<&str> {
        self.meta_text(meta_keys::SMILES)
    }

    /// The explicit charge, or one inferred from ion mode and then adduct.
    ///
    /// Returns `None` when the charge is zero and nothing can be inferred.
    pub fn resolved_charge(&self) -> Option<i32> {
        if self.charge != 0 {
            return Some(self.charge);
        }
        self.ion_mode()
            .and_then(charge_from_ion_mode)
            .or_else(|| self.precursor_type().and_then(charge_from_adduct))
    }
}

/// Parse a charge string such as `2+`, `1-`, `-1`, `+2` or `3`.
///
/// A bare sign is read as a single charge.
pub fn parse_charge(text: &str) -> Option<i32> {
    let t = text.trim();
    if t.is_empty() {
        return None;
    }
    let (sign, digits) = if let Some(d) = t.strip_suffix('+') {
        (1, d)
    } else if let Some(d) = t.strip_suffix('-') {
        (-1, d)
    } else if let Some(d) = t.strip_prefix('+') {
        (1, d)
    } else if let Some(d) = t.strip_prefix('-') {
        (-1, d)
    } else {
        (1, t)
    };
    let digits = digits.trim();
    if digits.is_empty() {
        return Some(sign);
    }
    digits.parse::<i32>().ok().map(|n| sign * n.abs())
}

/// `positive…` → +1, `negative…` → -1.
pub fn charge_from_ion_mode(ion_mode: &str) -> Option<i32> {
    match ion_mode.trim().chars().next()? {
        'p' | 'P' => Some(1),
        'n' | 'N' => Some(-1),
        _ => None,
    }
}

/// `[M+H]+` → +1, `[M-H]-` → -1.
pub fn charge_from_adduct(adduct: &str) -> Option<i32> {
    match adduct.trim().chars().last()? {
        '+' => Some(1),
        '-' => Some(-1),
        _ => None,
    }
}

/// The four search modes, serialized with the names the UI expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    IdentitySearch,
    OpenSearch,
    NeutralLossSearch,
    HybridSearch,
}

impl SearchMode {
    pub const ALL: [SearchMode; 4] = [
        SearchMode::IdentitySearch,
        SearchMode::OpenSearch,
        SearchMode::NeutralLossSearch,
        SearchMode::HybridSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::IdentitySearch => "identity_search",
            SearchMode::OpenSearch => "open_search",
            SearchMode::NeutralLossSearch => "neutral_loss_search",
            SearchMode::HybridSearch => "hybrid_search",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "identity_search" => Ok(SearchMode::IdentitySearch),
            "open" | "open_search" => Ok(SearchMode::OpenSearch),
            "neutral_loss" | "neutral_loss_search" => Ok(SearchMode::NeutralLossSearch),
            "hybrid" | "hybrid_search" => Ok(SearchMode::HybridSearch),
            other => bail!(
                "Unknown search mode: {}. Use identity, open, neutral_loss, or hybrid.",
                other
            ),
        }
    }
}

/// Addressable key of a library spectrum: its charge partition and its
/// insertion index within that partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LibraryRef {
    pub charge: i32,
    pub idx: usize,
}

/// One ranked library hit for a query spectrum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub library_ref: LibraryRef,
    /// Similarity in `[0.0, 1.0]`.
    pub score: f64,
    /// Precursor m/z of the library spectrum.
    pub precursor_mz: f64,
    /// `query.precursor_mz - library.precursor_mz`.
    pub delta_mz: f64,
    /// Number of matched peak pairs, used as the first tie-breaker.
    pub matched_peaks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_charge_variants() {
        assert_eq!(parse_charge("2+"), Some(2));
        assert_eq!(parse_charge("1-"), Some(-1));
        assert_eq!(parse_charge("-1"), Some(-1));
        assert_eq!(parse_charge("+3"), Some(3));
        assert_eq!(parse_charge("2"), Some(2));
        assert_eq!(parse_charge("+"), Some(1));
        assert_eq!(parse_charge("0"), Some(0));
        assert_eq!(parse_charge(""), None);
        assert_eq!(parse_charge("2+ and 3+"), None);
    }

    #[test]
    fn resolved_charge_prefers_explicit_value() {
        let s = Spectrum::new(1, 200.0, vec![Peak::new(100.0, 1.0)])
            .with_charge(-2)
            .with_metadata(meta_keys::ION_MODE, MetaValue::from_text("Positive"));
        assert_eq!(s.resolved_charge(), Some(-2));
    }

    #[test]
    fn resolved_charge_from_ion_mode_then_adduct() {
        let by_mode = Spectrum::new(1, 200.0, vec![Peak::new(100.0, 1.0)])
            .with_metadata(meta_keys::ION_MODE, MetaValue::from_text("negative"));
        assert_eq!(by_mode.resolved_charge(), Some(-1));

        let by_adduct = Spectrum::new(1, 200.0, vec![Peak::new(100.0, 1.0)])
            .with_metadata(meta_keys::PRECURSOR_TYPE, MetaValue::from_text("[M+Na]+"));
        assert_eq!(by_adduct.resolved_charge(), Some(1));

        let unknown = Spectrum::new(1, 200.0, vec![Peak::new(100.0, 1.0)]);
        assert_eq!(unknown.resolved_charge(), None);
    }

    #[test]
    fn search_mode_names() {
        for mode in SearchMode::ALL {
            assert_eq!(mode.as_str().parse::<SearchMode>().unwrap(), mode);
        }
        assert_eq!(
            serde_json::to_string(&SearchMode::NeutralLossSearch).unwrap(),
            "\"neutral_loss_search\""
        );
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn meta_value_from_text() {
        assert_eq!(MetaValue::from_text(" 12.5 "), MetaValue::Number(12.5));
        assert_eq!(
            MetaValue::from_text("Caffeine"),
            MetaValue::Text("Caffeine".to_string())
        );
    }
}
