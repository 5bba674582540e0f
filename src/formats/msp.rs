//! NIST MSP reader.
//!
//! Records are `Key: value` header lines followed by `Num Peaks: N` and peak
//! lines. Records are separated by blank lines; a `Name:` line after peaks
//! also starts a new record. Peak lines may hold several `mz intensity`
//! pairs separated by `;` and may carry quoted annotations.

use std::path::Path;

use super::{parse_peak_pair, Collector, LoadOptions, Loaded, RawRecord};
use crate::error::SearchError;

pub fn parse(path: &Path, text: &str, opts: &LoadOptions) -> Result<Loaded, SearchError> {
    let mut collector = Collector::new(path, opts);
    let mut record = RawRecord::default();
    let mut record_no = 0usize;
    let mut in_peaks = false;
    let mut error: Option<String> = None;

    let mut flush = |record: &mut RawRecord,
                     error: &mut Option<String>,
                     record_no: &mut usize|
     -> Result<(), SearchError> {
        if record.is_empty() && error.is_none() {
            return Ok(());
        }
        *record_no += 1;
        let taken = std::mem::take(record);
        let result = match error.take() {
            Some(message) => Err(message),
            None => taken.into_spectrum(*record_no as u32),
        };
        collector.push(*record_no, result)
    };

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut record, &mut error, &mut record_no)?;
            in_peaks = false;
            continue;
        }

        let lower = line.to_ascii_lowercase();
        if in_peaks && lower.starts_with("name:") {
            flush(&mut record, &mut error, &mut record_no)?;
            in_peaks = false;
        }

        if !in_peaks {
            if let Some((key, value)) = line.split_once(':') {
                let key_lower = key.trim().to_ascii_lowercase();
                if key_lower == "num peaks" || key_lower == "num_peaks" {
                    in_peaks = true;
                }
                record.header(key, value);
                continue;
            }
            in_peaks = true;
        }

        for chunk in line.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            match parse_peak_pair(chunk) {
                Some((mz, intensity)) => record.peak(mz, intensity),
                None => {
                    if error.is_none() {
                        error = Some(format!("unparsable peak line: {}", line));
                    }
                }
            }
        }
    }
    flush(&mut record, &mut error, &mut record_no)?;

    Ok(collector.finish())
}
