//! Circuit-breaking wrapper around any fetcher.

use super::{CircuitBreaker, DataFetcher, FetchError};
use crate::domain::{Bar, Frequency};
use chrono::NaiveDateTime;
use std::sync::Arc;
use tracing::warn;

pub struct GuardedFetcher {
    inner: Arc<dyn DataFetcher>,
    breaker: CircuitBreaker,
}

impl GuardedFetcher {
    pub fn new(inner: Arc<dyn DataFetcher>, breaker: CircuitBreaker) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl DataFetcher for GuardedFetcher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fetch(
        &self,
        symbol: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: Frequency,
    ) -> Result<Vec<Bar>, FetchError> {
        if !self.breaker.is_allowed() {
            return Err(FetchError::CircuitOpen {
                remaining_secs: self.breaker.remaining_cooldown().as_secs(),
            });
        }
        match self.inner.fetch(symbol, start, end, frequency) {
            Ok(bars) => {
                self.breaker.record_success();
                Ok(bars)
            }
            Err(e) => {
                match &e {
                    FetchError::RateLimited { .. } => {
                        warn!(provider = self.inner.name(), "rate limited, opening circuit");
                        self.breaker.trip();
                    }
                    // A missing symbol says nothing about the provider's health.
                    FetchError::NotFound { .. } => {}
                    _ => self.breaker.record_failure(),
                }
                Err(e)
            }
        }
    }

    fn is_available(&self) -> bool {
        self.breaker.is_allowed() && self.inner.is_available()
    }
}
