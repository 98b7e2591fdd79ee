//! Store configuration loaded from TOML.
//!
//! ```toml
//! base_path = "data"
//! lookback_days = 7
//!
//! [providers.synthetic]
//! guarded = true
//! settings = { seed = "7", calendar = "weekdays" }
//!
//! [[datasets]]
//! provider = "synthetic"
//! symbol = "SPY"
//! frequency = "daily"
//! strategy = "INCREMENTAL"
//! calendar = { kind = "weekdays" }
//! ```
//!
//! Every field has a default, so an empty file is a valid config.

use crate::clock::Clock;
use crate::domain::{DatasetKey, Frequency};
use crate::fetch::{CircuitBreaker, DataFetcher, GuardedFetcher, ProviderRegistry, ProviderSettings};
use crate::gaps::{MarketCalendar, DEFAULT_GAP_TOLERANCE};
use crate::partition::{PartitionLevel, PartitionScheme};
use crate::storage::StorageEngine;
use crate::update::{UpdateManager, UpdateRequest, UpdateSettings, UpdateStrategy};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub base_path: PathBuf,
    pub lock_timeout_ms: u64,
    pub lock_ttl_secs: u64,
    /// Applies to every frequency without an override.
    pub partition_granularity: Option<PartitionLevel>,
    /// Frequency name (`"1min"`, `"daily"`, ...) to granularity.
    pub partition_overrides: BTreeMap<String, PartitionLevel>,
    pub stale_after_hours: i64,
    pub bootstrap_start: NaiveDate,
    pub default_history_days: i64,
    pub lookback_days: i64,
    pub gap_tolerance: f64,
    pub generate_profile: bool,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub datasets: Vec<DatasetConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("data"),
            lock_timeout_ms: 30_000,
            lock_ttl_secs: 600,
            partition_granularity: None,
            partition_overrides: BTreeMap::new(),
            stale_after_hours: 72,
            bootstrap_start: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default(),
            default_history_days: 365,
            lookback_days: 7,
            gap_tolerance: DEFAULT_GAP_TOLERANCE,
            generate_profile: false,
            providers: BTreeMap::new(),
            datasets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Registry entry to build from; defaults to the table name.
    pub kind: Option<String>,
    /// Wrap the fetcher in a circuit breaker.
    pub guarded: bool,
    pub cooldown_secs: Option<u64>,
    pub settings: ProviderSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub provider: String,
    pub symbol: String,
    pub frequency: Frequency,
    #[serde(default = "default_strategy")]
    pub strategy: UpdateStrategy,
    #[serde(default)]
    pub calendar: MarketCalendar,
    pub lookback_days: Option<i64>,
    pub start: Option<NaiveDate>,
}

fn default_strategy() -> UpdateStrategy {
    UpdateStrategy::Incremental
}

impl DatasetConfig {
    pub fn key(&self) -> Result<DatasetKey, ConfigError> {
        DatasetKey::new(&self.provider, self.frequency, &self.symbol)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn request(&self) -> Result<UpdateRequest, ConfigError> {
        let mut request =
            UpdateRequest::new(self.key()?, self.strategy).with_calendar(self.calendar.clone());
        if let Some(days) = self.lookback_days {
            request = request.with_lookback(Duration::days(days));
        }
        if let Some(start) = self.start {
            request = request.with_start(start.and_time(chrono::NaiveTime::MIN));
        }
        Ok(request)
    }
}

impl StoreConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.gap_tolerance.is_finite() || self.gap_tolerance < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gap_tolerance must be a non-negative number, got {}",
                self.gap_tolerance
            )));
        }
        for (name, value) in [
            ("lookback_days", self.lookback_days),
            ("default_history_days", self.default_history_days),
            ("stale_after_hours", self.stale_after_hours),
        ] {
            if value <= 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        self.scheme()?;
        let mut seen = BTreeSet::new();
        for dataset in &self.datasets {
            let key = dataset.key()?;
            if !seen.insert(key.clone()) {
                return Err(ConfigError::Invalid(format!("dataset {key} listed twice")));
            }
        }
        Ok(())
    }

    pub fn scheme(&self) -> Result<PartitionScheme, ConfigError> {
        let mut scheme = PartitionScheme::new();
        if let Some(level) = self.partition_granularity {
            scheme = scheme.with_granularity(level);
        }
        for (frequency, level) in &self.partition_overrides {
            let frequency: Frequency = frequency
                .parse()
                .map_err(|e: crate::error::StoreError| ConfigError::Invalid(e.to_string()))?;
            scheme = scheme.with_override(frequency, *level);
        }
        Ok(scheme)
    }

    pub fn engine(&self) -> Result<StorageEngine, ConfigError> {
        Ok(StorageEngine::new(&self.base_path)
            .with_scheme(self.scheme()?)
            .with_lock_timeout(std::time::Duration::from_millis(self.lock_timeout_ms))
            .with_lock_ttl(std::time::Duration::from_secs(self.lock_ttl_secs)))
    }

    pub fn update_settings(&self) -> UpdateSettings {
        UpdateSettings {
            bootstrap_start: self.bootstrap_start.and_time(chrono::NaiveTime::MIN),
            default_history: Duration::days(self.default_history_days),
            default_lookback: Duration::days(self.lookback_days),
            gap_tolerance: self.gap_tolerance,
            generate_profile: self.generate_profile,
        }
    }

    pub fn requests(&self) -> Result<Vec<UpdateRequest>, ConfigError> {
        self.datasets.iter().map(DatasetConfig::request).collect()
    }

    /// Build a fetcher for every provider named by a dataset or configured
    /// explicitly.
    pub fn fetchers(
        &self,
        registry: &ProviderRegistry,
    ) -> Result<BTreeMap<String, Arc<dyn DataFetcher>>, ConfigError> {
        let names: BTreeSet<&str> = self
            .providers
            .keys()
            .map(String::as_str)
            .chain(self.datasets.iter().map(|d| d.provider.as_str()))
            .collect();

        let mut fetchers = BTreeMap::new();
        for name in names {
            let provider = self.providers.get(name).cloned().unwrap_or_default();
            let kind = provider.kind.as_deref().unwrap_or(name);
            let mut fetcher = registry
                .create(kind, &provider.settings)
                .map_err(|e| ConfigError::Invalid(format!("provider '{name}': {e}")))?;
            if provider.guarded {
                let breaker = match provider.cooldown_secs {
                    Some(secs) => CircuitBreaker::new(std::time::Duration::from_secs(secs)),
                    None => CircuitBreaker::default_provider(),
                };
                let guarded: Arc<dyn DataFetcher> = Arc::new(GuardedFetcher::new(fetcher, breaker));
                fetcher = guarded;
            }
            fetchers.insert(name.to_string(), fetcher);
        }
        Ok(fetchers)
    }

    pub fn manager(
        &self,
        registry: &ProviderRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<UpdateManager, ConfigError> {
        let mut manager = UpdateManager::new(self.engine()?, clock)
            .with_settings(self.update_settings())
            .with_stale_after(Duration::hours(self.stale_after_hours));
        for (name, fetcher) in self.fetchers(registry)? {
            manager = manager.with_fetcher(name, fetcher);
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    const SAMPLE: &str = r#"
base_path = "/tmp/bars"
lookback_days = 3
partition_overrides = { "1h" = "day" }

[providers.synthetic]
guarded = true
settings = { seed = "7" }

[[datasets]]
provider = "synthetic"
symbol = "SPY"
frequency = "daily"
calendar = { kind = "weekdays", holidays = ["2024-01-15"] }

[[datasets]]
provider = "synthetic"
symbol = "BTC"
frequency = "1h"
strategy = "BACKFILL"
start = "2024-01-01"
"#;

    #[test]
    fn empty_config_uses_defaults() {
        let config = StoreConfig::from_toml("").unwrap();
        assert_eq!(config, StoreConfig::default());
    }

    #[test]
    fn parses_datasets_and_overrides() {
        let config = StoreConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.lookback_days, 3);
        assert_eq!(config.datasets.len(), 2);
        assert_eq!(config.datasets[0].strategy, UpdateStrategy::Incremental);
        assert_eq!(config.datasets[1].strategy, UpdateStrategy::Backfill);
        assert_eq!(
            config.scheme().unwrap().granularity_for(Frequency::Hourly),
            PartitionLevel::Day
        );

        let requests = config.requests().unwrap();
        assert_eq!(requests[0].key.to_string(), "synthetic/daily/SPY");
        assert!(!requests[0]
            .calendar
            .is_trading(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_time(chrono::NaiveTime::MIN)));
        assert!(requests[1].start.is_some());
    }

    #[test]
    fn builds_a_manager_with_guarded_fetchers() {
        let config = StoreConfig::from_toml(SAMPLE).unwrap();
        let fetchers = config.fetchers(&ProviderRegistry::with_defaults()).unwrap();
        assert_eq!(fetchers["synthetic"].name(), "synthetic");
        assert!(fetchers["synthetic"].is_available());

        let clock = Arc::new(FixedClock::new(config.update_settings().bootstrap_start));
        assert!(config.manager(&ProviderRegistry::with_defaults(), clock).is_ok());
    }

    #[test]
    fn rejects_duplicates_and_bad_values() {
        let dup = r#"
[[datasets]]
provider = "p"
symbol = "A"
frequency = "daily"
[[datasets]]
provider = "p"
symbol = "A"
frequency = "daily"
"#;
        assert!(matches!(StoreConfig::from_toml(dup), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            StoreConfig::from_toml("gap_tolerance = -1.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            StoreConfig::from_toml("partition_overrides = { \"2min\" = \"day\" }"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(StoreConfig::from_toml("lookback_days = \"x\""), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let config = StoreConfig::from_toml(
            "[[datasets]]\nprovider = \"nowhere\"\nsymbol = \"A\"\nfrequency = \"daily\"\n",
        )
        .unwrap();
        assert!(config.fetchers(&ProviderRegistry::with_defaults()).is_err());
    }
}
