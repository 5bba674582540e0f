//! `info` and `pack` commands.
//!
//! `info` loads a spectral file and prints what a search would see: spectrum
//! and peak counts, and how the spectra split into charge partitions.
//! `pack` converts any loadable file into the `.esi` binary format.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use entropy_search_core::models::Spectrum;
use tracing::info;

use crate::config::Config;
use crate::formats::{self, LoadOptions};
use crate::progress::format_number;

/// Spectra per resolved charge; `None` collects spectra whose charge cannot
/// be determined.
pub fn charge_breakdown(spectra: &[Spectrum]) -> BTreeMap<Option<i32>, usize> {
    let mut counts = BTreeMap::new();
    for s in spectra {
        *counts.entry(s.resolved_charge()).or_insert(0) += 1;
    }
    counts
}

pub fn run_info(config: &Config, path: &Path) -> Result<()> {
    let opts = LoadOptions {
        skip_invalid: config.preprocess.skip_invalid_records,
    };
    let loaded = formats::load(path, &opts)?;
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let peaks: usize = loaded.spectra.iter().map(|s| s.peaks().len()).sum();

    println!("Entropy Search File Info");
    println!("========================");
    println!();
    println!("  File:        {}", path.display());
    println!("  Size:        {}", format_bytes(size));
    println!();
    println!("  Spectra:     {}", format_number(loaded.spectra.len() as u64));
    println!("  Peaks:       {}", format_number(peaks as u64));
    if loaded.skipped > 0 {
        println!("  Skipped:     {}", format_number(loaded.skipped as u64));
    }

    let breakdown = charge_breakdown(&loaded.spectra);
    if !breakdown.is_empty() {
        println!();
        println!("  By charge:");
        println!("  {:<10} {:>10}", "CHARGE", "SPECTRA");
        println!("  {}", "-".repeat(21));
        for (charge, count) in &breakdown {
            let label = match charge {
                Some(c) => format!("{:+}", c),
                None => "unknown".to_string(),
            };
            println!("  {:<10} {:>10}", label, format_number(*count as u64));
        }
    }
    println!();
    Ok(())
}

pub fn run_pack(config: &Config, input: &Path, output: &Path) -> Result<()> {
    let opts = LoadOptions {
        skip_invalid: config.preprocess.skip_invalid_records,
    };
    let count = formats::pack(input, output, &opts)
        .with_context(|| format!("Failed to pack {}", input.display()))?;
    info!(spectra = count, output = %output.display(), "library packed");
    println!(
        "Packed {} spectra into {}",
        format_number(count as u64),
        output.display()
    );
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
