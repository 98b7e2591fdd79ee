use crate::domain::DatasetKey;
use crate::error::StoreError;
use crate::gaps::MarketCalendar;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an update cycle chooses what to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStrategy {
    /// From the last stored bar (or the lookback horizon) to now.
    Incremental,
    /// From the last stored bar to now; older rows are dropped.
    AppendOnly,
    /// Replace everything with a fresh download, in one transaction.
    FullRefresh,
    /// Fetch only the gaps inside the stored range.
    Backfill,
}

impl UpdateStrategy {
    pub const ALL: [UpdateStrategy; 4] = [
        UpdateStrategy::Incremental,
        UpdateStrategy::AppendOnly,
        UpdateStrategy::FullRefresh,
        UpdateStrategy::Backfill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::Incremental => "incremental",
            UpdateStrategy::AppendOnly => "append_only",
            UpdateStrategy::FullRefresh => "full_refresh",
            UpdateStrategy::Backfill => "backfill",
        }
    }

    /// Strategies that retry a failed cycle's range first.
    pub fn resumes(&self) -> bool {
        matches!(self, UpdateStrategy::Incremental | UpdateStrategy::Backfill)
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "incremental" => Ok(UpdateStrategy::Incremental),
            "append_only" | "append" => Ok(UpdateStrategy::AppendOnly),
            "full_refresh" | "full" | "refresh" => Ok(UpdateStrategy::FullRefresh),
            "backfill" => Ok(UpdateStrategy::Backfill),
            _ => Err(StoreError::Runtime(format!("unknown update strategy '{s}'"))),
        }
    }
}

/// One dataset's update cycle.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub key: DatasetKey,
    pub strategy: UpdateStrategy,
    /// Overrides the manager's default lookback (INCREMENTAL).
    pub lookback: Option<Duration>,
    /// First timestamp to request when the strategy starts from scratch
    /// (FULL_REFRESH, or INCREMENTAL/APPEND_ONLY without metadata).
    pub start: Option<NaiveDateTime>,
    pub calendar: MarketCalendar,
}

impl UpdateRequest {
    pub fn new(key: DatasetKey, strategy: UpdateStrategy) -> Self {
        Self {
            key,
            strategy,
            lookback: None,
            start: None,
            calendar: MarketCalendar::default(),
        }
    }

    pub fn with_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = Some(lookback);
        self
    }

    pub fn with_start(mut self, start: NaiveDateTime) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_calendar(mut self, calendar: MarketCalendar) -> Self {
        self.calendar = calendar;
        self
    }
}
