//! Time-based partition scheme.
//!
//! Each dataset is split into Hive-style buckets:
//! `year=YYYY/month=MM[/day=DD][/hour=HH]`. The granularity is a pure
//! function of the frequency (overridable), so readers can compute the
//! candidate partitions for a range by key arithmetic instead of scanning
//! directories.
//!
//! Default table (targets roughly 1-2M rows per file for one symbol):
//!
//! | frequency            | levels              |
//! |----------------------|---------------------|
//! | 1min, 5min, 15min, 30min | year / month / day |
//! | 1h, daily, weekly    | year / month        |
//!
//! Files are never split or merged based on their measured size.

use crate::domain::Frequency;
use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One level of the partition hierarchy, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionLevel {
    Year,
    Month,
    Day,
    Hour,
}

impl PartitionLevel {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionLevel::Year => "year",
            PartitionLevel::Month => "month",
            PartitionLevel::Day => "day",
            PartitionLevel::Hour => "hour",
        }
    }

    /// All levels from `year` down to and including `self`.
    pub fn hierarchy(&self) -> Vec<PartitionLevel> {
        [
            PartitionLevel::Year,
            PartitionLevel::Month,
            PartitionLevel::Day,
            PartitionLevel::Hour,
        ]
        .into_iter()
        .filter(|level| level <= self)
        .collect()
    }
}

/// Identifies one partition bucket. Finer fields are `None` above the
/// bucket's granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub hour: Option<u32>,
}

impl PartitionKey {
    pub fn for_timestamp(ts: NaiveDateTime, granularity: PartitionLevel) -> Self {
        let fine = |level: PartitionLevel, value: u32| (granularity >= level).then_some(value);
        Self {
            year: ts.year(),
            month: fine(PartitionLevel::Month, ts.month()),
            day: fine(PartitionLevel::Day, ts.day()),
            hour: fine(PartitionLevel::Hour, ts.hour()),
        }
    }

    pub fn granularity(&self) -> PartitionLevel {
        if self.hour.is_some() {
            PartitionLevel::Hour
        } else if self.day.is_some() {
            PartitionLevel::Day
        } else if self.month.is_some() {
            PartitionLevel::Month
        } else {
            PartitionLevel::Year
        }
    }

    /// `year=2024/month=01/day=05` style path relative to the dataset root.
    pub fn relative_path(&self) -> PathBuf {
        let mut path = PathBuf::from(format!("year={:04}", self.year));
        if let Some(month) = self.month {
            path.push(format!("month={month:02}"));
        }
        if let Some(day) = self.day {
            path.push(format!("day={day:02}"));
        }
        if let Some(hour) = self.hour {
            path.push(format!("hour={hour:02}"));
        }
        path
    }

    /// Parse a sequence of `name=value` directory components. Returns `None`
    /// unless the components form a valid, gap-free hierarchy.
    pub fn from_components<S: AsRef<str>>(components: &[S]) -> Option<Self> {
        let mut values: Vec<(PartitionLevel, i64)> = Vec::with_capacity(components.len());
        for component in components {
            let (name, value) = component.as_ref().split_once('=')?;
            let level = match name {
                "year" => PartitionLevel::Year,
                "month" => PartitionLevel::Month,
                "day" => PartitionLevel::Day,
                "hour" => PartitionLevel::Hour,
                _ => return None,
            };
            values.push((level, value.parse().ok()?));
        }

        let expected = values.last()?.0.hierarchy();
        if values.len() != expected.len() || values.iter().zip(&expected).any(|(v, e)| v.0 != *e)
        {
            return None;
        }

        let get = |i: usize| values.get(i).map(|(_, v)| *v);
        let key = Self {
            year: i32::try_from(get(0)?).ok()?,
            month: get(1).map(u32::try_from).transpose().ok()?,
            day: get(2).map(u32::try_from).transpose().ok()?,
            hour: get(3).map(u32::try_from).transpose().ok()?,
        };
        key.checked_start().map(|_| key)
    }

    fn checked_start(&self) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month.unwrap_or(1), self.day.unwrap_or(1))?
            .and_hms_opt(self.hour.unwrap_or(0), 0, 0)
    }

    /// First instant covered by this bucket.
    pub fn start(&self) -> NaiveDateTime {
        // Keys are only built from real timestamps or validated components.
        self.checked_start().unwrap_or_default()
    }

    /// First instant after this bucket, or `None` for the last bucket chrono
    /// can represent.
    pub fn checked_end(&self) -> Option<NaiveDateTime> {
        let start = self.checked_start()?;
        match self.granularity() {
            PartitionLevel::Year => NaiveDate::from_ymd_opt(self.year.checked_add(1)?, 1, 1)?
                .and_hms_opt(0, 0, 0),
            PartitionLevel::Month => start.checked_add_months(Months::new(1)),
            PartitionLevel::Day => start.checked_add_signed(Duration::days(1)),
            PartitionLevel::Hour => start.checked_add_signed(Duration::hours(1)),
        }
    }

    /// First instant after this bucket, saturating at `NaiveDateTime::MAX`.
    pub fn end_exclusive(&self) -> NaiveDateTime {
        self.checked_end().unwrap_or(NaiveDateTime::MAX)
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start() <= ts && self.checked_end().map_or(true, |end| ts < end)
    }

    /// Whether any instant of `[start, end]` falls in this bucket.
    pub fn overlaps(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        start <= end && self.start() <= end && self.checked_end().map_or(true, |e| start < e)
    }

    /// The bucket immediately following this one at the same granularity,
    /// `None` past the end of chrono's range.
    pub fn next(&self) -> Option<Self> {
        let next = Self::for_timestamp(self.checked_end()?, self.granularity());
        (next > *self).then_some(next)
    }
}

/// Maps a frequency to its partition granularity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionScheme {
    global: Option<PartitionLevel>,
    overrides: HashMap<Frequency, PartitionLevel>,
}

impl PartitionScheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one granularity for every frequency (unless overridden per frequency).
    pub fn with_granularity(mut self, granularity: PartitionLevel) -> Self {
        self.global = Some(granularity);
        self
    }

    pub fn with_override(mut self, frequency: Frequency, granularity: PartitionLevel) -> Self {
        self.overrides.insert(frequency, granularity);
        self
    }

    pub fn granularity_for(&self, frequency: Frequency) -> PartitionLevel {
        if let Some(level) = self.overrides.get(&frequency) {
            return *level;
        }
        if let Some(level) = self.global {
            return level;
        }
        if frequency.is_sub_hourly() {
            PartitionLevel::Day
        } else {
            PartitionLevel::Month
        }
    }

    /// Ordered partition-key names for a frequency, e.g. `[year, month]`.
    pub fn keys_for(&self, frequency: Frequency) -> Vec<PartitionLevel> {
        self.granularity_for(frequency).hierarchy()
    }

    pub fn partition_for(&self, ts: NaiveDateTime, frequency: Frequency) -> PartitionKey {
        PartitionKey::for_timestamp(ts, self.granularity_for(frequency))
    }

    /// Every bucket that can hold rows in `[start, end]`, in time order.
    pub fn iter_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: Frequency,
    ) -> impl Iterator<Item = PartitionKey> {
        let last = self.partition_for(end, frequency);
        let first = (start <= end).then(|| self.partition_for(start, frequency));
        std::iter::successors(first, PartitionKey::next).take_while(move |key| *key <= last)
    }

    pub fn partitions_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: Frequency,
    ) -> Vec<PartitionKey> {
        self.iter_between(start, end, frequency).collect()
    }

    /// Like [`partitions_between`](Self::partitions_between), but `None` once
    /// the range spans more than `limit` buckets.
    pub fn partitions_between_bounded(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: Frequency,
        limit: usize,
    ) -> Option<Vec<PartitionKey>> {
        let keys: Vec<PartitionKey> = self
            .iter_between(start, end, frequency)
            .take(limit.saturating_add(1))
            .collect();
        (keys.len() <= limit).then_some(keys)
    }

    /// The listed partitions this scheme would consult for `[start, end]`.
    pub fn retain_between(
        &self,
        listed: Vec<PartitionKey>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        frequency: Frequency,
    ) -> Vec<PartitionKey> {
        let granularity = self.granularity_for(frequency);
        listed
            .into_iter()
            .filter(|p| p.granularity() == granularity && p.overlaps(start, end))
            .collect()
    }
}
