//! Bars and sampling frequencies.

use crate::error::StoreError;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One OHLCV row. Timestamps are UTC wall-clock without an offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn new(
        timestamp: NaiveDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// A flat bar where every price equals `price`.
    pub fn flat(timestamp: NaiveDateTime, price: f64, volume: f64) -> Self {
        Self::new(timestamp, price, price, price, price, volume)
    }
}

/// Inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Range spanned by a non-empty, sorted batch.
    pub fn of_bars(bars: &[Bar]) -> Option<TimeRange> {
        match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => Some(TimeRange::new(first.timestamp, last.timestamp)),
            _ => None,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Native sampling frequency of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "1min")]
    Minute1,
    #[serde(rename = "5min")]
    Minute5,
    #[serde(rename = "15min")]
    Minute15,
    #[serde(rename = "30min")]
    Minute30,
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "daily")]
    Daily,
    #[serde(rename = "weekly")]
    Weekly,
}

impl Frequency {
    pub const ALL: [Frequency; 7] = [
        Frequency::Minute1,
        Frequency::Minute5,
        Frequency::Minute15,
        Frequency::Minute30,
        Frequency::Hourly,
        Frequency::Daily,
        Frequency::Weekly,
    ];

    /// Nominal spacing between consecutive bars.
    pub fn step(&self) -> Duration {
        match self {
            Frequency::Minute1 => Duration::minutes(1),
            Frequency::Minute5 => Duration::minutes(5),
            Frequency::Minute15 => Duration::minutes(15),
            Frequency::Minute30 => Duration::minutes(30),
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
        }
    }

    /// Directory name used in the on-disk layout.
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Minute1 => "1min",
            Frequency::Minute5 => "5min",
            Frequency::Minute15 => "15min",
            Frequency::Minute30 => "30min",
            Frequency::Hourly => "1h",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }

    pub fn is_sub_hourly(&self) -> bool {
        self.step() < Duration::hours(1)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let freq = match normalized.as_str() {
            "1min" | "1m" | "minute" => Frequency::Minute1,
            "5min" | "5m" => Frequency::Minute5,
            "15min" | "15m" => Frequency::Minute15,
            "30min" | "30m" => Frequency::Minute30,
            "1h" | "60min" | "hourly" | "hour" => Frequency::Hourly,
            "daily" | "1d" | "day" => Frequency::Daily,
            "weekly" | "1w" | "week" => Frequency::Weekly,
            _ => return Err(StoreError::InvalidFrequency(s.to_string())),
        };
        Ok(freq)
    }
}
