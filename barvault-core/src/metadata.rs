//! Per-dataset bookkeeping sidecar.
//!
//! One `.metadata.json` per dataset records the stored extent, row count,
//! the last [`HISTORY_CAPACITY`] update cycles, derived health and any gaps
//! left after the last cycle. Every mutation is a read-modify-write under
//! the dataset lock, which the storage engine's writes also take, and the
//! sidecar itself is replaced atomically.

use crate::clock::Clock;
use crate::domain::{DatasetKey, Frequency, TimeRange};
use crate::error::{FailureKind, StoreError};
use crate::gaps::Gap;
use crate::lock::LockManager;
use crate::profile::DatasetProfile;
use crate::storage::atomic::{remove_if_exists, write_atomic};
use crate::storage::{dataset_lock_name, Layout, StorageEngine};
use crate::update::UpdateStrategy;
use chrono::{Duration, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const HISTORY_CAPACITY: usize = 100;
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// A failure this many entries back still marks the dataset stale.
const RECENT_FAILURE_WINDOW: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed { kind: FailureKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHistoryEntry {
    pub recorded_at: NaiveDateTime,
    pub strategy: UpdateStrategy,
    pub outcome: Outcome,
    pub rows_added: usize,
    pub rows_updated: usize,
    /// Range the cycle attempted; a failed cycle's range is retried first.
    pub range: Option<TimeRange>,
}

impl UpdateHistoryEntry {
    pub fn success(
        recorded_at: NaiveDateTime,
        strategy: UpdateStrategy,
        rows_added: usize,
        rows_updated: usize,
        range: Option<TimeRange>,
    ) -> Self {
        Self {
            recorded_at,
            strategy,
            outcome: Outcome::Success,
            rows_added,
            rows_updated,
            range,
        }
    }

    pub fn failure(
        recorded_at: NaiveDateTime,
        strategy: UpdateStrategy,
        kind: FailureKind,
        message: impl Into<String>,
        range: Option<TimeRange>,
    ) -> Self {
        Self {
            recorded_at,
            strategy,
            outcome: Outcome::Failed {
                kind,
                message: message.into(),
            },
            rows_added: 0,
            rows_updated: 0,
            range,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// Fixed-capacity history; the oldest entry is dropped first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<UpdateHistoryEntry>", into = "Vec<UpdateHistoryEntry>")]
pub struct UpdateHistory {
    entries: VecDeque<UpdateHistoryEntry>,
}

impl UpdateHistory {
    pub fn push(&mut self, entry: UpdateHistoryEntry) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn latest(&self) -> Option<&UpdateHistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &UpdateHistoryEntry> {
        self.entries.iter()
    }

    /// The `n` newest entries, newest first.
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &UpdateHistoryEntry> {
        self.entries.iter().rev().take(n)
    }

    /// Range of the latest entry if that entry is a failure.
    pub fn pending_retry(&self) -> Option<TimeRange> {
        self.latest().filter(|e| e.is_failure()).and_then(|e| e.range)
    }
}

impl From<Vec<UpdateHistoryEntry>> for UpdateHistory {
    fn from(entries: Vec<UpdateHistoryEntry>) -> Self {
        let mut history = UpdateHistory::default();
        for entry in entries {
            history.push(entry);
        }
        history
    }
}

impl From<UpdateHistory> for Vec<UpdateHistoryEntry> {
    fn from(history: UpdateHistory) -> Self {
        history.entries.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Health {
    Healthy,
    Stale,
    Error,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "HEALTHY",
            Health::Stale => "STALE",
            Health::Error => "ERROR",
        })
    }
}

/// Stored extent of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetExtent {
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub row_count: usize,
}

impl DatasetExtent {
    pub fn empty() -> Self {
        Self {
            first_timestamp: None,
            last_timestamp: None,
            row_count: 0,
        }
    }

    /// Extent of a normalized batch.
    pub fn of_sorted(timestamps: &[NaiveDateTime]) -> Self {
        Self {
            first_timestamp: timestamps.first().copied(),
            last_timestamp: timestamps.last().copied(),
            row_count: timestamps.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub key: DatasetKey,
    pub provider: String,
    pub frequency: Frequency,
    pub first_timestamp: Option<NaiveDateTime>,
    pub last_timestamp: Option<NaiveDateTime>,
    pub row_count: usize,
    pub update_history: UpdateHistory,
    pub health: Health,
    #[serde(default)]
    pub known_gaps: Vec<Gap>,
    pub schema_version: u32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl MetadataRecord {
    pub fn new(key: DatasetKey, now: NaiveDateTime) -> Self {
        Self {
            provider: key.provider.clone(),
            frequency: key.frequency,
            key,
            first_timestamp: None,
            last_timestamp: None,
            row_count: 0,
            update_history: UpdateHistory::default(),
            health: Health::Healthy,
            known_gaps: Vec::new(),
            schema_version: CURRENT_SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn extent(&self) -> DatasetExtent {
        DatasetExtent {
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
            row_count: self.row_count,
        }
    }

    pub fn range(&self) -> Option<TimeRange> {
        Some(TimeRange::new(self.first_timestamp?, self.last_timestamp?))
    }

    pub(crate) fn set_extent(&mut self, extent: DatasetExtent) {
        self.first_timestamp = extent.first_timestamp;
        self.last_timestamp = extent.last_timestamp;
        self.row_count = extent.row_count;
    }
}

/// Health of a record as of `now`.
///
/// ERROR if the newest history entry failed; STALE if the data is older than
/// `stale_after` or a failure appears among the last few entries; HEALTHY
/// otherwise.
pub fn health_of(record: &MetadataRecord, now: NaiveDateTime, stale_after: Duration) -> Health {
    let history = &record.update_history;
    if history.latest().is_some_and(UpdateHistoryEntry::is_failure) {
        return Health::Error;
    }
    let data_is_old = record
        .last_timestamp
        .map_or(true, |last| now - last > stale_after);
    let recent_failure = history
        .recent(RECENT_FAILURE_WINDOW)
        .any(UpdateHistoryEntry::is_failure);
    if data_is_old || recent_failure {
        Health::Stale
    } else {
        Health::Healthy
    }
}

/// One mutation applied by [`MetadataTracker::update`].
#[derive(Debug, Clone)]
pub struct MetadataDelta {
    pub entry: UpdateHistoryEntry,
    /// Rows that did not exist before this cycle.
    pub rows_added: usize,
    /// Range of rows written this cycle; widens the stored extent.
    pub observed: Option<TimeRange>,
    /// Replace the extent outright (full refresh, migration).
    pub reset: Option<DatasetExtent>,
    /// Gaps still open after this cycle, if they were checked.
    pub known_gaps: Option<Vec<Gap>>,
}

impl MetadataDelta {
    pub fn success(entry: UpdateHistoryEntry, rows_added: usize, observed: Option<TimeRange>) -> Self {
        Self {
            entry,
            rows_added,
            observed,
            reset: None,
            known_gaps: None,
        }
    }

    pub fn failure(entry: UpdateHistoryEntry) -> Self {
        Self {
            entry,
            rows_added: 0,
            observed: None,
            reset: None,
            known_gaps: None,
        }
    }

    pub fn with_reset(mut self, extent: DatasetExtent) -> Self {
        self.reset = Some(extent);
        self
    }

    pub fn with_known_gaps(mut self, gaps: Vec<Gap>) -> Self {
        self.known_gaps = Some(gaps);
        self
    }

    fn creates_record(&self) -> bool {
        !self.entry.is_failure() || self.reset.is_some() || self.observed.is_some()
    }
}

#[derive(Clone)]
pub struct MetadataTracker {
    layout: Layout,
    locks: LockManager,
    lock_timeout: std::time::Duration,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl MetadataTracker {
    pub fn new(engine: &StorageEngine, clock: Arc<dyn Clock>) -> Self {
        Self {
            layout: engine.layout().clone(),
            locks: engine.locks().clone(),
            lock_timeout: engine.lock_timeout(),
            clock,
            stale_after: Duration::hours(72),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn get(&self, key: &DatasetKey) -> Result<Option<MetadataRecord>, StoreError> {
        read_json(&self.layout.metadata_file(key))
    }

    /// Replace the record wholesale.
    pub fn put(&self, key: &DatasetKey, record: &MetadataRecord) -> Result<(), StoreError> {
        let _guard = self.locks.acquire(&dataset_lock_name(key), self.lock_timeout)?;
        write_json(&self.layout.metadata_file(key), record)
    }

    pub fn remove(&self, key: &DatasetKey) -> Result<bool, StoreError> {
        let _guard = self.locks.acquire(&dataset_lock_name(key), self.lock_timeout)?;
        remove_if_exists(&self.layout.metadata_file(key))
    }

    /// Apply `delta` and persist. A failure that wrote nothing, recorded
    /// against a dataset that has no record yet, creates nothing and
    /// returns `None`.
    pub fn update(
        &self,
        key: &DatasetKey,
        delta: MetadataDelta,
    ) -> Result<Option<MetadataRecord>, StoreError> {
        let _guard = self.locks.acquire(&dataset_lock_name(key), self.lock_timeout)?;
        let now = self.clock.now();

        let mut record = match self.get(key)? {
            Some(record) => record,
            None if delta.creates_record() => MetadataRecord::new(key.clone(), now),
            None => {
                debug!(key = %key, "no metadata yet, failure not recorded");
                return Ok(None);
            }
        };

        if let Some(extent) = delta.reset {
            record.set_extent(extent);
        }
        if let Some(range) = delta.observed {
            record.first_timestamp = Some(record.first_timestamp.map_or(range.start, |t| t.min(range.start)));
            record.last_timestamp = Some(record.last_timestamp.map_or(range.end, |t| t.max(range.end)));
        }
        record.row_count += delta.rows_added;
        if let Some(gaps) = delta.known_gaps {
            record.known_gaps = gaps;
        }
        record.update_history.push(delta.entry);
        record.health = health_of(&record, now, self.stale_after);
        record.updated_at = now;

        write_json(&self.layout.metadata_file(key), &record)?;
        debug!(key = %key, rows = record.row_count, health = %record.health, "metadata updated");
        Ok(Some(record))
    }

    /// Append a failed cycle to the history.
    pub fn record_failure(
        &self,
        key: &DatasetKey,
        entry: UpdateHistoryEntry,
    ) -> Result<Option<MetadataRecord>, StoreError> {
        self.update(key, MetadataDelta::failure(entry))
    }

    /// Health as of now; `None` for unknown datasets.
    pub fn compute_health(
        &self,
        key: &DatasetKey,
        stale_after: Duration,
    ) -> Result<Option<Health>, StoreError> {
        Ok(self
            .get(key)?
            .map(|record| health_of(&record, self.clock.now(), stale_after)))
    }

    pub fn write_profile(&self, key: &DatasetKey, profile: &DatasetProfile) -> Result<(), StoreError> {
        write_json(&self.layout.profile_file(key), profile)
    }

    pub fn read_profile(&self, key: &DatasetKey) -> Result<Option<DatasetProfile>, StoreError> {
        read_json(&self.layout.profile_file(key))
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path)(e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::Metadata(format!("{}: {e}", path.display())))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Metadata(format!("serialize {}: {e}", path.display())))?;
    write_atomic(path, &json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::NaiveDate;

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn key() -> DatasetKey {
        DatasetKey::new("test", Frequency::Daily, "SPY").unwrap()
    }

    fn tracker(dir: &Path, now: NaiveDateTime) -> (MetadataTracker, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(now));
        let engine = StorageEngine::new(dir);
        (MetadataTracker::new(&engine, clock.clone()), clock)
    }

    fn ok_entry(at: NaiveDateTime) -> UpdateHistoryEntry {
        UpdateHistoryEntry::success(at, UpdateStrategy::Incremental, 1, 0, None)
    }

    fn failed_entry(at: NaiveDateTime) -> UpdateHistoryEntry {
        UpdateHistoryEntry::failure(
            at,
            UpdateStrategy::Incremental,
            FailureKind::Network,
            "boom",
            Some(TimeRange::new(day(3), day(4))),
        )
    }

    #[test]
    fn first_success_creates_record() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = tracker(dir.path(), day(5));
        let delta = MetadataDelta::success(ok_entry(day(5)), 3, Some(TimeRange::new(day(1), day(3))));
        let record = tracker.update(&key(), delta).unwrap().unwrap();
        assert_eq!(record.row_count, 3);
        assert_eq!(record.last_timestamp, Some(day(3)));
        assert_eq!(tracker.get(&key()).unwrap(), Some(record));
    }

    #[test]
    fn failure_without_record_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = tracker(dir.path(), day(5));
        assert!(tracker.record_failure(&key(), failed_entry(day(5))).unwrap().is_none());
        assert!(tracker.get(&key()).unwrap().is_none());
    }

    #[test]
    fn history_is_capped() {
        let mut history = UpdateHistory::default();
        for i in 0..(HISTORY_CAPACITY + 25) {
            history.push(ok_entry(day(1) + Duration::minutes(i as i64)));
        }
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(
            history.iter().next().unwrap().recorded_at,
            day(1) + Duration::minutes(25)
        );

        let json = serde_json::to_string(&history).unwrap();
        let back: UpdateHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn health_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, clock) = tracker(dir.path(), day(4));
        let stale_after = Duration::days(2);
        let observed = Some(TimeRange::new(day(1), day(3)));
        tracker
            .update(&key(), MetadataDelta::success(ok_entry(day(4)), 3, observed))
            .unwrap();
        assert_eq!(tracker.compute_health(&key(), stale_after).unwrap(), Some(Health::Healthy));

        tracker.record_failure(&key(), failed_entry(day(4))).unwrap();
        assert_eq!(tracker.compute_health(&key(), stale_after).unwrap(), Some(Health::Error));

        // A later success still leaves a recent failure in the window.
        tracker
            .update(&key(), MetadataDelta::success(ok_entry(day(4)), 0, None))
            .unwrap();
        assert_eq!(tracker.compute_health(&key(), stale_after).unwrap(), Some(Health::Stale));

        for _ in 0..RECENT_FAILURE_WINDOW {
            tracker
                .update(&key(), MetadataDelta::success(ok_entry(day(4)), 0, None))
                .unwrap();
        }
        assert_eq!(tracker.compute_health(&key(), stale_after).unwrap(), Some(Health::Healthy));

        clock.set(day(10));
        assert_eq!(tracker.compute_health(&key(), stale_after).unwrap(), Some(Health::Stale));
        assert_eq!(tracker.compute_health(&DatasetKey::new("x", Frequency::Daily, "Y").unwrap(), stale_after).unwrap(), None);
    }

    #[test]
    fn pending_retry_is_the_failed_range() {
        let mut history = UpdateHistory::default();
        history.push(ok_entry(day(1)));
        assert_eq!(history.pending_retry(), None);
        history.push(failed_entry(day(2)));
        assert_eq!(history.pending_retry(), Some(TimeRange::new(day(3), day(4))));
    }

    #[test]
    fn reset_replaces_extent() {
        let dir = tempfile::tempdir().unwrap();
        let (tracker, _) = tracker(dir.path(), day(5));
        tracker
            .update(
                &key(),
                MetadataDelta::success(ok_entry(day(5)), 999, Some(TimeRange::new(day(1), day(4)))),
            )
            .unwrap();
        let extent = DatasetExtent::of_sorted(&[day(2), day(3)]);
        let record = tracker
            .update(&key(), MetadataDelta::success(ok_entry(day(5)), 0, None).with_reset(extent))
            .unwrap()
            .unwrap();
        assert_eq!(record.row_count, 2);
        assert_eq!(record.first_timestamp, Some(day(2)));
    }
}
