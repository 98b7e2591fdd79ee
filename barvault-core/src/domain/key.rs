//! Logical dataset identity.

use super::bar::Frequency;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one dataset: (provider, frequency, symbol).
///
/// Symbols are made filesystem-safe on construction (`BTC/USD` becomes
/// `BTC_USD`) so the key maps onto exactly one directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetKey {
    pub provider: String,
    pub frequency: Frequency,
    pub symbol: String,
}

impl DatasetKey {
    pub fn new(
        provider: impl Into<String>,
        frequency: Frequency,
        symbol: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let provider = provider.into().trim().to_string();
        let symbol = sanitize_symbol(&symbol.into());

        if provider.is_empty() || symbol.is_empty() {
            return Err(StoreError::InvalidKey(format!(
                "provider and symbol must be non-empty (got '{provider}', '{symbol}')"
            )));
        }
        if provider.contains(['/', '\\', '=']) || provider.starts_with('.') {
            return Err(StoreError::InvalidKey(format!(
                "provider '{provider}' is not a valid directory name"
            )));
        }
        if symbol.starts_with('.') || symbol.contains('=') {
            return Err(StoreError::InvalidKey(format!(
                "symbol '{symbol}' is not a valid directory name"
            )));
        }

        Ok(Self {
            provider,
            frequency,
            symbol,
        })
    }
}

impl fmt::Display for DatasetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.provider, self.frequency, self.symbol)
    }
}

fn sanitize_symbol(raw: &str) -> String {
    raw.trim().replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_is_made_filesystem_safe() {
        let key = DatasetKey::new("binance", Frequency::Hourly, "BTC/USD").unwrap();
        assert_eq!(key.symbol, "BTC_USD");
        assert_eq!(key.to_string(), "binance/1h/BTC_USD");
    }

    #[test]
    fn rejects_empty_and_hidden_components() {
        assert!(DatasetKey::new("", Frequency::Daily, "SPY").is_err());
        assert!(DatasetKey::new("yahoo", Frequency::Daily, "  ").is_err());
        assert!(DatasetKey::new(".locks", Frequency::Daily, "SPY").is_err());
        assert!(DatasetKey::new("yahoo", Frequency::Daily, ".metadata").is_err());
        assert!(DatasetKey::new("yahoo", Frequency::Daily, "year=2024").is_err());
    }
}
