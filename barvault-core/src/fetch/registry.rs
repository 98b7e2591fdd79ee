//! Provider discovery: a name -> factory map.

use super::{CsvFetcher, DataFetcher, FetchError, SyntheticFetcher};
use crate::gaps::MarketCalendar;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Free-form per-provider settings, straight from the config file.
pub type ProviderSettings = BTreeMap<String, String>;

pub type FetcherFactory =
    Box<dyn Fn(&ProviderSettings) -> Result<Arc<dyn DataFetcher>, FetchError> + Send + Sync>;

pub struct ProviderRegistry {
    factories: BTreeMap<String, FetcherFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `synthetic` (settings: `seed`, `calendar = continuous|weekdays`) and
    /// `csv` (settings: `dir`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("synthetic", |settings| {
            let seed = match settings.get("seed") {
                Some(raw) => raw
                    .parse()
                    .map_err(|_| FetchError::Configuration(format!("seed '{raw}' is not a u64")))?,
                None => 42,
            };
            let calendar = match settings.get("calendar").map(String::as_str) {
                None | Some("continuous") => MarketCalendar::Continuous,
                Some("weekdays") => MarketCalendar::weekdays(),
                Some(other) => {
                    return Err(FetchError::Configuration(format!(
                        "unknown calendar '{other}'"
                    )))
                }
            };
            let fetcher: Arc<dyn DataFetcher> =
                Arc::new(SyntheticFetcher::new(seed).with_calendar(calendar));
            Ok(fetcher)
        });
        registry.register("csv", |settings| {
            let dir = settings
                .get("dir")
                .ok_or_else(|| FetchError::Configuration("csv provider needs 'dir'".into()))?;
            let fetcher: Arc<dyn DataFetcher> = Arc::new(CsvFetcher::new(dir));
            Ok(fetcher)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ProviderSettings) -> Result<Arc<dyn DataFetcher>, FetchError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(
        &self,
        name: &str,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn DataFetcher>, FetchError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            FetchError::Configuration(format!(
                "unknown provider '{name}' (known: {})",
                self.names().join(", ")
            ))
        })?;
        factory(settings)
    }
}
