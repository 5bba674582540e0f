//! Library spectra partitioned by charge.
//!
//! Every entry is addressed by a [`LibraryRef`]: the charge of its partition
//! and its insertion order within that partition. Entries keep the original
//! spectrum for retrieval and a [`PreparedSpectrum`] for scoring.

use std::collections::BTreeMap;

use crate::models::{LibraryRef, Spectrum};
use crate::peaks::{CleaningParams, PreparedSpectrum};

#[derive(Debug, Clone)]
pub struct LibraryEntry {
    pub idx: usize,
    pub spectrum: Spectrum,
    pub prepared: PreparedSpectrum,
}

#[derive(Debug, Clone, Default)]
pub struct Library {
    partitions: BTreeMap<i32, Vec<LibraryEntry>>,
    len: usize,
}

impl Library {
    /// Partition `spectra` by resolved charge, keeping file order inside
    /// each partition. Spectra with no resolvable charge go to partition 0.
    pub fn build(spectra: Vec<Spectrum>, cleaning: &CleaningParams) -> Self {
        let mut partitions: BTreeMap<i32, Vec<LibraryEntry>> = BTreeMap::new();
        let len = spectra.len();
        for spectrum in spectra {
            let charge = spectrum.resolved_charge().unwrap_or(0);
            let entries = partitions.entry(charge).or_default();
            let prepared = PreparedSpectrum::prepare(&spectrum, cleaning);
            entries.push(LibraryEntry {
                idx: entries.len(),
                spectrum,
                prepared,
            });
        }
        Self { partitions, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn partitions(&self) -> &BTreeMap<i32, Vec<LibraryEntry>> {
        &self.partitions
    }

    pub fn partition(&self, charge: i32) -> Option<&[LibraryEntry]> {
        self.partitions.get(&charge).map(Vec::as_slice)
    }

    pub fn get(&self, library_ref: LibraryRef) -> Option<&LibraryEntry> {
        self.partitions
            .get(&library_ref.charge)?
            .get(library_ref.idx)
    }

    /// `(charge, count)` for every partition, ascending by charge.
    pub fn charge_counts(&self) -> Vec<(i32, usize)> {
        self.partitions
            .iter()
            .map(|(&charge, entries)| (charge, entries.len()))
            .collect()
    }
}
