//! Error taxonomy shared by the loaders, the job manager and the HTTP layer.
//!
//! CLI and start-up paths use `anyhow`; anything that can end up in a job
//! status or an HTTP response body is a [`SearchError`].

use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum SearchError {
    /// Input file is malformed or has an unsupported extension.
    Parse { path: PathBuf, message: String },
    /// Input file could not be read.
    Io { path: PathBuf, source: std::io::Error },
    /// Unknown scan or library reference.
    NotFound(String),
    /// A job is already running and the server rejects new submissions.
    Busy,
    /// Results were requested before any exist.
    NotReady(String),
    /// A single query failed; the batch continues.
    Internal(String),
}

impl SearchError {
    pub fn parse(path: &Path, message: impl Into<String>) -> Self {
        SearchError::Parse {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    /// Parse error pointing at a 1-based record number.
    pub fn record(path: &Path, record: usize, message: impl std::fmt::Display) -> Self {
        SearchError::Parse {
            path: path.to_path_buf(),
            message: format!("record {}: {}", record, message),
        }
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        SearchError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchError::Parse { path, message } => {
                write!(f, "failed to parse {}: {}", path.display(), message)
            }
            SearchError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            SearchError::NotFound(what) => write!(f, "not found: {}", what),
            SearchError::Busy => write!(f, "a search job is already running"),
            SearchError::NotReady(what) => write!(f, "not ready: {}", what),
            SearchError::Internal(e) => write!(f, "internal error: {}", e),
        }
    }
}

impl std::error::Error for SearchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SearchError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
