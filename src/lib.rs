//! # Entropy Search
//!
//! Spectral library search for tandem mass spectra using entropy similarity.
//!
//! A search loads a query file and a library file, builds m/z indexes over
//! the library, and scores every query in four modes (identity, open,
//! neutral loss, hybrid) on a worker pool. Results are published per query
//! as they finish, so the UI can poll and display them while the batch runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   formats   │──▶│ orchestrator │──▶│     job      │
//! │ MSP/MGF/... │   │ rayon + mpsc │   │ status+hits  │
//! └─────────────┘   └──────┬───────┘   └──────┬───────┘
//!                          │                  │
//!                          ▼                  ▼
//!                   ┌──────────────┐   ┌──────────────┐
//!                   │  core crate  │   │  HTTP / CLI  │
//!                   │ index+score  │   │              │
//!                   └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! entropy_search_backend serve                      # HTTP backend on :8711
//! entropy_search_backend search --query q.mgf --library lib.msp --format json
//! entropy_search_backend pack lib.msp lib.esi       # binary library
//! entropy_search_backend info lib.esi
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy for jobs and HTTP |
//! | [`formats`] | MSP, MGF, mzML and `.esi` loaders |
//! | [`info`] | `info` and `pack` commands |
//! | [`orchestrator`] | Batch search on a worker pool |
//! | [`job`] | Job state machine and result store |
//! | [`progress`] | Progress events and reporters |
//! | [`search`] | `search` command |
//! | [`server`] | HTTP backend |

pub mod config;
pub mod error;
pub mod formats;
pub mod info;
pub mod job;
pub mod orchestrator;
pub mod progress;
pub mod search;
pub mod server;
