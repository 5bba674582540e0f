//! # Entropy Search Core
//!
//! Pure search logic for Entropy Search: spectrum models, peak cleaning,
//! the charge-partitioned library, bucketed m/z indexes, entropy similarity
//! and per-query search.
//!
//! This crate contains no async runtime, file I/O, or HTTP dependencies.
//! Parsing spectral files, running batches and serving results live in the
//! `entropy-search` application crate.

pub mod index;
pub mod library;
pub mod models;
pub mod peaks;
pub mod search;
pub mod similarity;
