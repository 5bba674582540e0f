//! `.esi` binary library format.
//!
//! Layout: the 4-byte magic `ESI1` followed by a gzip stream holding the
//! bincode encoding of `Vec<Spectrum>`. Spectra are re-normalized on load.

use std::io::{Read, Write};
use std::path::Path;

use entropy_search_core::models::Spectrum;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use super::Loaded;
use crate::error::SearchError;

pub const MAGIC: &[u8; 4] = b"ESI1";

/// Upper bound on inflated payload bytes and on memory claimed while decoding.
const DECODE_LIMIT: usize = 1 << 31;

pub fn encode(spectra: &[Spectrum]) -> Result<Vec<u8>, String> {
    let payload = bincode::encode_to_vec(spectra, bincode::config::standard())
        .map_err(|e| format!("bincode: {}", e))?;
    let mut out = MAGIC.to_vec();
    let mut encoder = GzEncoder::new(&mut out, Compression::default());
    encoder
        .write_all(&payload)
        .map_err(|e| format!("gzip: {}", e))?;
    encoder.finish().map_err(|e| format!("gzip: {}", e))?;
    Ok(out)
}

pub fn decode(path: &Path, bytes: &[u8]) -> Result<Loaded, SearchError> {
    let body = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| SearchError::parse(path, "not an .esi file (bad magic)"))?;

    let mut payload = Vec::with_capacity(body.len() * 4);
    GzDecoder::new(body)
        .take(DECODE_LIMIT as u64 + 1)
        .read_to_end(&mut payload)
        .map_err(|e| SearchError::parse(path, format!("gzip: {}", e)))?;
    if payload.len() > DECODE_LIMIT {
        return Err(SearchError::parse(path, "payload exceeds 2 GiB"));
    }

    // Length prefixes are checked against the limit before anything is allocated.
    let config = bincode::config::standard().with_limit::<DECODE_LIMIT>();
    let (spectra, _): (Vec<Spectrum>, usize) = bincode::decode_from_slice(&payload, config)
        .map_err(|e| SearchError::parse(path, format!("bincode: {}", e)))?;

    Ok(Loaded {
        spectra: spectra.into_iter().map(Spectrum::into_normalized).collect(),
        ..Loaded::default()
    })
}

pub fn save(path: &Path, spectra: &[Spectrum]) -> Result<(), SearchError> {
    let bytes = encode(spectra).map_err(|e| SearchError::parse(path, e))?;
    std::fs::write(path, bytes).map_err(|e| SearchError::io(path, e))
}
