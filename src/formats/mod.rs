//! Spectral file readers.
//!
//! [`load`] dispatches on the file extension:
//!
//! | Extension | Reader |
//! |-----------|--------|
//! | `.msp` | [`msp`] |
//! | `.mgf` | [`mgf`] |
//! | `.mzml` | [`mzml`] (MS2 spectra only) |
//! | `.esi` | [`esi`] (binary library format) |
//! | `.gz` | gzip-wrapped text format, dispatched on the inner extension |
//! | `.zip` | first archive entry, dispatched on the entry name |
//!
//! Every reader produces normalized [`Spectrum`]s. Malformed records fail
//! the whole file unless [`LoadOptions::skip_invalid`] is set, in which case
//! they are counted and skipped.

pub mod esi;
pub mod mgf;
pub mod msp;
pub mod mzml;

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use entropy_search_core::models::{meta_keys, parse_charge, MetaValue, Peak, Spectrum};
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use crate::error::SearchError;

/// Maximum decompressed bytes read from a single archive entry.
const MAX_ENTRY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Skip malformed records instead of failing.
    pub skip_invalid: bool,
}

/// Spectra read from one file.
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub spectra: Vec<Spectrum>,
    /// Malformed records skipped under [`LoadOptions::skip_invalid`].
    pub skipped: usize,
    /// Read from the `.esi` sidecar by [`load_cached`].
    pub from_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Msp,
    Mgf,
    MzMl,
    Esi,
}

impl Format {
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "msp" => Some(Format::Msp),
            "mgf" => Some(Format::Mgf),
            "mzml" => Some(Format::MzMl),
            "esi" => Some(Format::Esi),
            _ => None,
        }
    }
}

/// Load every spectrum from `path`.
pub fn load(path: &Path, opts: &LoadOptions) -> Result<Loaded, SearchError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let lower = name.to_ascii_lowercase();

    let loaded = if let Some(inner) = lower.strip_suffix(".gz") {
        let bytes = std::fs::read(path).map_err(|e| SearchError::io(path, e))?;
        let mut decoded = Vec::with_capacity(bytes.len());
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut decoded)
            .map_err(|e| SearchError::parse(path, format!("gzip: {}", e)))?;
        load_bytes(path, inner, &decoded, opts)?
    } else if lower.ends_with(".zip") {
        let bytes = std::fs::read(path).map_err(|e| SearchError::io(path, e))?;
        let (entry_name, decoded) = read_first_zip_entry(path, &bytes)?;
        load_bytes(path, &entry_name, &decoded, opts)?
    } else {
        let format = Format::from_name(&lower).ok_or_else(|| unsupported(path))?;
        let bytes = std::fs::read(path).map_err(|e| SearchError::io(path, e))?;
        parse_format(path, format, &bytes, opts)?
    };

    debug!(
        path = %path.display(),
        spectra = loaded.spectra.len(),
        skipped = loaded.skipped,
        "loaded spectral file"
    );
    Ok(loaded)
}

fn unsupported(path: &Path) -> SearchError {
    SearchError::parse(path, "unsupported file extension")
}

fn load_bytes(path: &Path, inner_name: &str, bytes: &[u8], opts: &LoadOptions) -> Result<Loaded, SearchError> {
    let format = Format::from_name(inner_name).ok_or_else(|| unsupported(path))?;
    parse_format(path, format, bytes, opts)
}

fn parse_format(path: &Path, format: Format, bytes: &[u8], opts: &LoadOptions) -> Result<Loaded, SearchError> {
    match format {
        Format::Msp => msp::parse(path, &String::from_utf8_lossy(bytes), opts),
        Format::Mgf => mgf::parse(path, &String::from_utf8_lossy(bytes), opts),
        Format::MzMl => mzml::parse(path, bytes, opts),
        Format::Esi => esi::decode(path, bytes),
    }
}

fn read_first_zip_entry(path: &Path, bytes: &[u8]) -> Result<(String, Vec<u8>), SearchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| SearchError::parse(path, format!("zip: {}", e)))?;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| SearchError::parse(path, format!("zip: {}", e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_ascii_lowercase();
        let mut out = Vec::new();
        entry
            .take(MAX_ENTRY_BYTES)
            .read_to_end(&mut out)
            .map_err(|e| SearchError::parse(path, format!("zip: {}", e)))?;
        return Ok((name, out));
    }
    Err(SearchError::parse(path, "zip archive is empty"))
}

/// Sidecar written by [`load_cached`]: the source path with `.esi` appended.
pub fn cache_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".esi");
    PathBuf::from(name)
}

/// Like [`load`], but reuses the `.esi` sidecar of `path` while it is at
/// least as new as the source, and rewrites it otherwise.
///
/// `.esi` inputs are loaded as is. A sidecar that cannot be read or written
/// is logged and bypassed.
pub fn load_cached(path: &Path, opts: &LoadOptions) -> Result<Loaded, SearchError> {
    if Format::from_name(&path.to_string_lossy()) == Some(Format::Esi) {
        return load(path, opts);
    }

    let source_modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| SearchError::io(path, e))?;
    let sidecar = cache_path(path);

    let cache_modified = std::fs::metadata(&sidecar).and_then(|m| m.modified());
    if matches!(cache_modified, Ok(t) if t >= source_modified) {
        match load(&sidecar, opts) {
            Ok(mut loaded) => {
                debug!(path = %sidecar.display(), "using cached library");
                loaded.from_cache = true;
                return Ok(loaded);
            }
            Err(e) => warn!(path = %sidecar.display(), "ignoring unreadable library cache: {}", e),
        }
    }

    let loaded = load(path, opts)?;
    match esi::save(&sidecar, &loaded.spectra) {
        Ok(()) => debug!(path = %sidecar.display(), spectra = loaded.spectra.len(), "wrote library cache"),
        Err(e) => warn!(path = %sidecar.display(), "could not write library cache: {}", e),
    }
    Ok(loaded)
}

/// Write any loadable file as `.esi`.
pub fn pack(input: &Path, output: &Path, opts: &LoadOptions) -> Result<usize, SearchError> {
    let loaded = load(input, opts)?;
    esi::save(output, &loaded.spectra)?;
    Ok(loaded.spectra.len())
}

/// Accumulates records, applying the strict/lenient policy.
pub(crate) struct Collector<'a> {
    path: &'a Path,
    opts: LoadOptions,
    seen_scans: HashSet<u32>,
    loaded: Loaded,
}

impl<'a> Collector<'a> {
    pub(crate) fn new(path: &'a Path, opts: &LoadOptions) -> Self {
        Self {
            path,
            opts: *opts,
            seen_scans: HashSet::new(),
            loaded: Loaded::default(),
        }
    }

    /// Record `result` for the 1-based record number `record`.
    pub(crate) fn push(&mut self, record: usize, result: Result<Spectrum, String>) -> Result<(), SearchError> {
        match result {
            Ok(spectrum) => {
                if !self.seen_scans.insert(spectrum.scan()) {
                    warn!(
                        path = %self.path.display(),
                        scan = spectrum.scan(),
                        "duplicate scan number, keeping the first"
                    );
                    return Ok(());
                }
                self.loaded.spectra.push(spectrum);
                Ok(())
            }
            Err(message) if self.opts.skip_invalid => {
                warn!(path = %self.path.display(), record, "skipping record: {}", message);
                self.loaded.skipped += 1;
                Ok(())
            }
            Err(message) => Err(SearchError::record(self.path, record, message)),
        }
    }

    pub(crate) fn finish(self) -> Loaded {
        self.loaded
    }
}

const PRECURSOR_KEYS: &[&str] = &["precursormz", "precursor_mz", "pepmass", "precursor mz"];
const CHARGE_KEYS: &[&str] = &["charge", "precursor_charge"];
const RT_KEYS: &[&str] = &["retentiontime", "retention_time", "rtinseconds", "rt"];
const NAME_KEYS: &[&str] = &["name", "title"];
const ID_KEYS: &[&str] = &["db#", "id", "spectrumid", "spectrum_id"];
const ADDUCT_KEYS: &[&str] = &["precursor_type", "precursortype", "adduct"];
const ION_MODE_KEYS: &[&str] = &["ion_mode", "ionmode"];
const SMILES_KEYS: &[&str] = &["smiles"];

/// Header key/value pairs plus peaks of one text record.
#[derive(Debug, Default)]
pub(crate) struct RawRecord {
    headers: Vec<(String, String)>,
    peaks: Vec<Peak>,
}

impl RawRecord {
    pub(crate) fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.peaks.is_empty()
    }

    pub(crate) fn header(&mut self, key: &str, value: &str) {
        self.headers
            .push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    pub(crate) fn peak(&mut self, mz: f64, intensity: f64) {
        self.peaks.push(Peak::new(mz, intensity));
    }

    fn first(&self, keys: &[&str]) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| keys.contains(&k.as_str()))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    /// Build the spectrum. `scan` is the record position in the file.
    pub(crate) fn into_spectrum(self, scan: u32) -> Result<Spectrum, String> {
        let precursor_mz = match self.first(PRECURSOR_KEYS) {
            Some(v) => v
                .split_whitespace()
                .next()
                .and_then(|t| t.parse::<f64>().ok())
                .ok_or_else(|| format!("unparsable precursor m/z: {}", v))?,
            None => return Err("missing precursor m/z".to_string()),
        };
        if !(precursor_mz.is_finite() && precursor_mz > 0.0) {
            return Err(format!("non-positive precursor m/z: {}", precursor_mz));
        }

        let charge = self.first(CHARGE_KEYS).and_then(parse_charge).unwrap_or(0);
        let retention_time = self
            .first(RT_KEYS)
            .and_then(|v| v.split_whitespace().next())
            .and_then(|t| t.parse::<f64>().ok());
        let id = self.first(ID_KEYS).unwrap_or_default().to_string();

        let mut metadata = BTreeMap::new();
        for (keys, canonical) in [
            (NAME_KEYS, meta_keys::NAME),
            (ADDUCT_KEYS, meta_keys::PRECURSOR_TYPE),
            (ION_MODE_KEYS, meta_keys::ION_MODE),
            (SMILES_KEYS, meta_keys::SMILES),
        ] {
            if let Some(v) = self.first(keys) {
                metadata.insert(canonical.to_string(), MetaValue::Text(v.to_string()));
            }
        }

        let consumed: Vec<&str> = [
            PRECURSOR_KEYS,
            CHARGE_KEYS,
            RT_KEYS,
            NAME_KEYS,
            ID_KEYS,
            ADDUCT_KEYS,
            ION_MODE_KEYS,
            SMILES_KEYS,
            &["num peaks", "num_peaks"],
        ]
        .concat();
        for (k, v) in &self.headers {
            if !consumed.contains(&k.as_str()) {
                metadata
                    .entry(k.clone())
                    .or_insert_with(|| MetaValue::from_text(v));
            }
        }

        let spectrum = Spectrum::new(scan, precursor_mz, self.peaks)
            .with_id(id)
            .with_charge(charge)
            .with_retention_time(retention_time)
            .with_all_metadata(metadata);

        if spectrum.peaks().is_empty() {
            return Err("empty peak list".to_string());
        }
        Ok(spectrum)
    }
}

/// Parse `mz intensity` from a peak line; extra columns and quoted
/// annotations are ignored.
pub(crate) fn parse_peak_pair(chunk: &str) -> Option<(f64, f64)> {
    let data = chunk.split('"').next().unwrap_or_default();
    let mut tokens = data
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty());
    let mz = tokens.next()?.parse::<f64>().ok()?;
    let intensity = tokens.next()?.parse::<f64>().ok()?;
    Some((mz, intensity))
}
