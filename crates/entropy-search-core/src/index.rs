//! Bucketed m/z indexes over a [`Library`].
//!
//! [`PeakIndex`] answers "which library peaks lie within `tol` of this m/z"
//! in `O(log n + k)`: peaks are grouped into fixed-width buckets keyed by
//! `floor(mz / width)`, each bucket is sorted, and the lower bound inside a
//! bucket is found with `partition_point`. Because the bucket width is never
//! smaller than the query tolerance, a window touches at most two buckets.
//!
//! [`PrecursorIndex`] applies the same idea to precursor m/z, keyed by
//! `(charge, bucket)`.
//!
//! The index is built once per job and is read-only afterwards, so it can be
//! shared between worker threads through an `Arc`.

use std::collections::{BTreeMap, HashMap};

use crate::library::Library;

/// Lower bound for bucket widths so tiny tolerances don't explode the map.
pub const MIN_BUCKET_WIDTH: f64 = 0.01;

/// A peak stored in a [`PeakIndex`], pointing back at its library spectrum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexedPeak {
    pub mz: f64,
    pub intensity: f64,
    /// Library `idx` within the charge partition.
    pub spectrum: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PeakIndex {
    bucket_width: f64,
    buckets: HashMap<i64, Vec<IndexedPeak>>,
    len: usize,
}

fn bucket_of(mz: f64, width: f64) -> i64 {
    (mz / width).floor() as i64
}

impl PeakIndex {
    pub fn build(entries: impl IntoIterator<Item = IndexedPeak>, bucket_width: f64) -> Self {
        let bucket_width = bucket_width.max(MIN_BUCKET_WIDTH);
        let mut buckets: HashMap<i64, Vec<IndexedPeak>> = HashMap::new();
        let mut len = 0;
        for peak in entries {
            buckets
                .entry(bucket_of(peak.mz, bucket_width))
                .or_default()
                .push(peak);
            len += 1;
        }
        for bucket in buckets.values_mut() {
            bucket.sort_by(|a, b| a.mz.total_cmp(&b.mz).then(a.spectrum.cmp(&b.spectrum)));
        }
        Self {
            bucket_width,
            buckets,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bucket_width(&self) -> f64 {
        self.bucket_width
    }

    /// All peaks with `|mz - center_mz| <= tolerance`, in ascending m/z order.
    pub fn query(&self, center_mz: f64, tolerance: f64) -> impl Iterator<Item = &IndexedPeak> + '_ {
        let lo = center_mz - tolerance;
        let hi = center_mz + tolerance;
        let width = self.bucket_width;
        (bucket_of(lo, width)..=bucket_of(hi, width))
            .filter_map(move |b| self.buckets.get(&b))
            .flat_map(move |bucket| {
                let start = bucket.partition_point(|p| p.mz < lo);
                bucket[start..].iter().take_while(move |p| p.mz <= hi)
            })
    }
}

/// Library spectra keyed by `(charge, floor(precursor_mz / width))`.
#[derive(Debug, Clone, Default)]
pub struct PrecursorIndex {
    bucket_width: f64,
    buckets: HashMap<(i32, i64), Vec<(f64, usize)>>,
}

impl PrecursorIndex {
    /// `entries` are `(charge, precursor_mz, idx)` triples.
    pub fn build(entries: impl IntoIterator<Item = (i32, f64, usize)>, bucket_width: f64) -> Self {
        let bucket_width = bucket_width.max(MIN_BUCKET_WIDTH);
        let mut buckets: HashMap<(i32, i64), Vec<(f64, usize)>> = HashMap::new();
        for (charge, precursor_mz, idx) in entries {
            buckets
                .entry((charge, bucket_of(precursor_mz, bucket_width)))
                .or_default()
                .push((precursor_mz, idx));
        }
        for bucket in buckets.values_mut() {
            bucket.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        }
        Self {
            bucket_width,
            buckets,
        }
    }

    /// Library idx values of `charge` whose precursor lies within
    /// `tolerance` of `precursor_mz`, in ascending idx order.
    pub fn query(&self, charge: i32, precursor_mz: f64, tolerance: f64) -> Vec<usize> {
        let lo = precursor_mz - tolerance;
        let hi = precursor_mz + tolerance;
        let mut hits: Vec<usize> = (bucket_of(lo, self.bucket_width)..=bucket_of(hi, self.bucket_width))
            .filter_map(|b| self.buckets.get(&(charge, b)))
            .flat_map(|bucket| {
                let start = bucket.partition_point(|(mz, _)| *mz < lo);
                bucket[start..]
                    .iter()
                    .take_while(move |(mz, _)| *mz <= hi)
                    .map(|(_, idx)| *idx)
            })
            .collect();
        hits.sort_unstable();
        hits
    }
}

/// Peak indexes for one charge partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionIndex {
    /// Prepared fragment m/z.
    pub fragments: PeakIndex,
    /// Prepared neutral losses (`precursor_mz - mz`).
    pub losses: PeakIndex,
}

/// Everything a search needs to narrow candidates across the library.
#[derive(Debug, Clone, Default)]
pub struct LibraryIndex {
    partitions: BTreeMap<i32, PartitionIndex>,
    precursors: PrecursorIndex,
}

impl LibraryIndex {
    /// Build fragment, loss and precursor indexes for every partition.
    ///
    /// `ms1_tolerance` and `ms2_tolerance` size the precursor and peak
    /// buckets respectively.
    pub fn build(library: &Library, ms1_tolerance: f64, ms2_tolerance: f64) -> Self {
        let mut partitions = BTreeMap::new();
        for (&charge, entries) in library.partitions() {
            let fragments = PeakIndex::build(
                entries.iter().flat_map(|e| {
                    e.prepared.peaks.iter().map(move |p| IndexedPeak {
                        mz: p.mz,
                        intensity: p.intensity,
                        spectrum: e.idx,
                    })
                }),
                ms2_tolerance,
            );
            let losses = PeakIndex::build(
                entries.iter().flat_map(|e| {
                    e.prepared.peaks.iter().map(move |p| IndexedPeak {
                        mz: e.prepared.precursor_mz - p.mz,
                        intensity: p.intensity,
                        spectrum: e.idx,
                    })
                }),
                ms2_tolerance,
            );
            partitions.insert(charge, PartitionIndex { fragments, losses });
        }

        let precursors = PrecursorIndex::build(
            library.partitions().iter().flat_map(|(&charge, entries)| {
                entries
                    .iter()
                    .map(move |e| (charge, e.spectrum.precursor_mz(), e.idx))
            }),
            ms1_tolerance,
        );

        Self {
            partitions,
            precursors,
        }
    }

    pub fn partition(&self, charge: i32) -> Option<&PartitionIndex> {
        self.partitions.get(&charge)
    }

    pub fn precursors(&self) -> &PrecursorIndex {
        &self.precursors
    }
}
