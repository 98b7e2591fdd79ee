//! Structured error types for storage and update operations.
//!
//! These are designed to be displayable in both CLI output and update
//! history entries. `FailureKind` is the serializable projection stored in
//! metadata sidecars.

use crate::fetch::FetchError;
use crate::gaps::Gap;
use crate::transaction::TransactionError;
use crate::validation::Violation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Timed out waiting for a lock. Recoverable: retry or skip the dataset.
    #[error("could not acquire lock on '{key}' within {waited_ms}ms")]
    LockAcquisition { key: String, waited_ms: u64 },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("batch rejected: {}", summarize_violations(.violations))]
    DataValidation { violations: Vec<Violation> },

    #[error("storage I/O error at {}: {source}", .path.display())]
    StorageIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("{} backfill range(s) failed: {}", .failures.len(), summarize_gap_failures(.failures))]
    GapFetch { failures: Vec<GapFailure> },

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("invalid dataset key: {0}")]
    InvalidKey(String),

    #[error("unknown frequency '{0}'")]
    InvalidFrequency(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::StorageIo {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Lock timeouts are the only errors a caller is expected to retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::LockAcquisition { .. })
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::LockAcquisition { .. } => FailureKind::LockTimeout,
            StoreError::Transaction(_) => FailureKind::Transaction,
            StoreError::DataValidation { .. } => FailureKind::DataValidation,
            StoreError::StorageIo { .. } | StoreError::Parquet(_) => FailureKind::StorageIo,
            StoreError::GapFetch { .. } => FailureKind::GapFetch,
            StoreError::Fetch(e) => e.kind(),
            StoreError::InvalidKey(_)
            | StoreError::InvalidFrequency(_)
            | StoreError::Metadata(_)
            | StoreError::Runtime(_) => FailureKind::Other,
        }
    }
}

/// One BACKFILL sub-range that could not be fetched.
#[derive(Debug, Clone)]
pub struct GapFailure {
    pub gap: Gap,
    pub kind: FailureKind,
    pub message: String,
}

/// Serializable classification of a failed update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    LockTimeout,
    Transaction,
    DataValidation,
    StorageIo,
    GapFetch,
    RateLimited,
    NotFound,
    Network,
    FetchValidation,
    CircuitOpen,
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::LockTimeout => "lock timeout",
            FailureKind::Transaction => "transaction",
            FailureKind::DataValidation => "data validation",
            FailureKind::StorageIo => "storage I/O",
            FailureKind::GapFetch => "gap fetch",
            FailureKind::RateLimited => "rate limited",
            FailureKind::NotFound => "not found",
            FailureKind::Network => "network",
            FailureKind::FetchValidation => "provider validation",
            FailureKind::CircuitOpen => "circuit open",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

fn summarize_violations(violations: &[Violation]) -> String {
    match violations.first() {
        None => "no violations recorded".to_string(),
        Some(first) if violations.len() == 1 => first.to_string(),
        Some(first) => format!("{first} (+{} more)", violations.len() - 1),
    }
}

fn summarize_gap_failures(failures: &[GapFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("({}, {}): {}", f.gap.start, f.gap.end, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
