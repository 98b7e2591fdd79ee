//! Data fetcher trait and structured fetch errors.
//!
//! `DataFetcher` abstracts over data sources so the update manager never
//! knows where bars come from. Rate limiting and circuit breaking are a
//! wrapper ([`GuardedFetcher`]), not something each source implements.

pub mod circuit_breaker;
pub mod csv_source;
pub mod guarded;
pub mod registry;
pub mod synthetic;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use csv_source::CsvFetcher;
pub use guarded::GuardedFetcher;
pub use registry::{FetcherFactory, ProviderRegistry, ProviderSettings};
pub use synthetic::SyntheticFetcher;

use crate::domain::{Bar, Frequency};
use crate::error::FailureKind;
use chrono::NaiveDateTime;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("symbol not found: {symbol}")]
    NotFound { symbol: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned malformed data: {0}")]
    Validation(String),

    #[error("provider blocked: circuit breaker open for another {remaining_secs}s")]
    CircuitOpen { remaining_secs: u64 },

    #[error("provider misconfigured: {0}")]
    Configuration(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::RateLimited { .. } => FailureKind::RateLimited,
            FetchError::NotFound { .. } => FailureKind::NotFound,
            FetchError::Network(_) => FailureKind::Network,
            FetchError::Validation(_) => FailureKind::FetchValidation,
            FetchError::CircuitOpen { .. } => FailureKind::CircuitOpen,
            FetchError::Configuration(_) => FailureKind::Other,
        }
    }
}

/// A source of bars. Implementations return rows inside `[start, end]`
/// (inclusive) at `frequency`, in any order.
pub trait DataFetcher: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: Frequency,
    ) -> Result<Vec<Bar>, FetchError>;

    /// Whether a fetch right now has a chance of succeeding.
    fn is_available(&self) -> bool {
        true
    }
}
