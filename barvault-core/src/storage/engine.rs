//! Blocking storage engine.
//!
//! Writes group rows by partition and merge each group into the stored file
//! under the dataset lock plus that partition's lock. Reads take no locks:
//! partition files are only ever replaced by rename, so a reader sees either
//! the old file or the new one.

use super::atomic::{remove_if_exists, sync_dir, write_atomic};
use super::layout::{prune_empty_dirs, Layout, QUARANTINE_FILE};
use super::merge::{merge, normalize, MergeStats};
use crate::codec;
use crate::domain::{Bar, DatasetKey};
use crate::error::StoreError;
use crate::lock::{LockGuard, LockManager};
use crate::partition::{PartitionKey, PartitionScheme};
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Past this many candidate buckets a read consults the partitions on disk
/// instead of enumerating keys.
pub const MAX_ENUMERATED_PARTITIONS: usize = 4096;

/// Outcome of one [`StorageEngine::write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Partition files actually rewritten. Partitions where the merge
    /// changed nothing are left untouched.
    pub partitions_written: usize,
}

impl WriteStats {
    fn absorb(&mut self, merge: MergeStats) {
        self.inserted += merge.inserted;
        self.updated += merge.updated;
        self.unchanged += merge.unchanged;
    }
}

/// Lock name covering a whole dataset.
pub fn dataset_lock_name(key: &DatasetKey) -> String {
    key.to_string()
}

/// Lock name covering one partition of a dataset.
pub fn partition_lock_name(key: &DatasetKey, partition: &PartitionKey) -> String {
    format!("{key}@{}", partition.relative_path().display())
}

#[derive(Debug, Clone)]
pub struct StorageEngine {
    layout: Layout,
    scheme: PartitionScheme,
    locks: LockManager,
    lock_timeout: Duration,
}

impl StorageEngine {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let layout = Layout::new(base);
        let locks = LockManager::new(layout.lock_dir());
        Self {
            layout,
            scheme: PartitionScheme::default(),
            locks,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_scheme(mut self, scheme: PartitionScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.locks = self.locks.with_ttl(ttl);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Hold the dataset lock. Writes made by this thread while the guard
    /// lives re-enter it.
    pub fn lock_dataset(&self, key: &DatasetKey) -> Result<LockGuard, StoreError> {
        self.locks.acquire(&dataset_lock_name(key), self.lock_timeout)
    }

    fn lock_partition(
        &self,
        key: &DatasetKey,
        partition: &PartitionKey,
    ) -> Result<LockGuard, StoreError> {
        self.locks
            .acquire(&partition_lock_name(key, partition), self.lock_timeout)
    }

    /// Merge `batch` into the stored dataset.
    pub fn write(&self, key: &DatasetKey, batch: Vec<Bar>) -> Result<WriteStats, StoreError> {
        let batch = normalize(batch);
        let mut stats = WriteStats::default();
        if batch.is_empty() {
            return Ok(stats);
        }

        let granularity = self.scheme.granularity_for(key.frequency);
        let mut groups: BTreeMap<PartitionKey, Vec<Bar>> = BTreeMap::new();
        for bar in batch {
            groups
                .entry(PartitionKey::for_timestamp(bar.timestamp, granularity))
                .or_default()
                .push(bar);
        }

        let _dataset = self.lock_dataset(key)?;
        for (partition, rows) in groups {
            let _partition = self.lock_partition(key, &partition)?;
            let path = self.layout.partition_file(key, &partition);
            let existing = codec::read_file(&path)?.unwrap_or_default();
            let (merged, merge_stats) = merge(&existing, &rows);
            stats.absorb(merge_stats);
            if merge_stats.changed() {
                write_atomic(&path, &codec::encode(&merged)?)?;
                stats.partitions_written += 1;
            }
        }

        debug!(
            key = %key,
            inserted = stats.inserted,
            updated = stats.updated,
            partitions = stats.partitions_written,
            "write complete"
        );
        Ok(stats)
    }

    /// Lazily iterate rows in `[start, end]` in timestamp order.
    ///
    /// Candidate partitions come from key arithmetic; a missing partition is
    /// simply empty. Open-ended ranges fall back to listing the partitions on
    /// disk. Each partition file is read when the iterator reaches it.
    pub fn read(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<RangeRead, StoreError> {
        let partitions = match self.scheme.partitions_between_bounded(
            start,
            end,
            key.frequency,
            MAX_ENUMERATED_PARTITIONS,
        ) {
            Some(partitions) => partitions,
            None => self.scheme.retain_between(
                self.list_partitions(key)?,
                start,
                end,
                key.frequency,
            ),
        };
        let paths = partitions
            .iter()
            .map(|p| self.layout.partition_file(key, p))
            .collect();
        Ok(RangeRead {
            paths,
            start,
            end,
            current: Vec::new().into_iter(),
        })
    }

    pub fn read_range(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, StoreError> {
        self.read(key, start, end)?.collect()
    }

    /// Every stored row, found by walking the partition directories.
    pub fn read_all(&self, key: &DatasetKey) -> Result<Vec<Bar>, StoreError> {
        let mut bars = Vec::new();
        for partition in self.list_partitions(key)? {
            if let Some(rows) = self.read_partition(key, &partition)? {
                bars.extend(rows);
            }
        }
        Ok(bars)
    }

    pub fn read_partition(
        &self,
        key: &DatasetKey,
        partition: &PartitionKey,
    ) -> Result<Option<Vec<Bar>>, StoreError> {
        codec::read_file(&self.layout.partition_file(key, partition))
    }

    pub fn list_partitions(&self, key: &DatasetKey) -> Result<Vec<PartitionKey>, StoreError> {
        self.layout.list_partitions(key)
    }

    pub fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError> {
        self.layout.list_keys()
    }

    pub fn exists(&self, key: &DatasetKey) -> Result<bool, StoreError> {
        Ok(!self.list_partitions(key)?.is_empty())
    }

    /// Replace one partition's content (no merge). An empty batch deletes it.
    pub fn write_partition(
        &self,
        key: &DatasetKey,
        partition: &PartitionKey,
        bars: Vec<Bar>,
    ) -> Result<(), StoreError> {
        let bars = normalize(bars);
        if bars.is_empty() {
            self.delete_partition(key, partition)?;
            return Ok(());
        }
        if let Some(stray) = bars.iter().find(|b| !partition.contains(b.timestamp)) {
            return Err(StoreError::InvalidKey(format!(
                "row at {} does not belong to partition {}",
                stray.timestamp,
                partition.relative_path().display()
            )));
        }

        let _dataset = self.lock_dataset(key)?;
        let _partition = self.lock_partition(key, partition)?;
        write_atomic(
            &self.layout.partition_file(key, partition),
            &codec::encode(&bars)?,
        )
    }

    /// Remove one partition file. Returns whether it existed.
    pub fn delete_partition(
        &self,
        key: &DatasetKey,
        partition: &PartitionKey,
    ) -> Result<bool, StoreError> {
        let _dataset = self.lock_dataset(key)?;
        let _partition = self.lock_partition(key, partition)?;
        let path = self.layout.partition_file(key, partition);
        let removed = remove_if_exists(&path)?;
        if removed {
            let dir = self.layout.partition_dir(key, partition);
            sync_dir(&dir)?;
            prune_empty_dirs(&dir, &self.layout.frequency_root(key));
        }
        Ok(removed)
    }

    /// Remove every partition of `key`. Sidecars are left to the metadata
    /// tracker. Returns the number of partitions removed.
    pub fn delete(&self, key: &DatasetKey) -> Result<usize, StoreError> {
        let _dataset = self.lock_dataset(key)?;
        let mut removed = 0;
        for partition in self.list_partitions(key)? {
            if self.delete_partition(key, &partition)? {
                removed += 1;
            }
        }
        debug!(key = %key, partitions = removed, "dataset deleted");
        Ok(removed)
    }

    /// Move a corrupt partition file aside so later reads and writes treat
    /// the partition as empty.
    pub fn quarantine_partition(
        &self,
        key: &DatasetKey,
        partition: &PartitionKey,
    ) -> Result<PathBuf, StoreError> {
        let _dataset = self.lock_dataset(key)?;
        let _partition = self.lock_partition(key, partition)?;
        let path = self.layout.partition_file(key, partition);
        let quarantined = path.with_file_name(QUARANTINE_FILE);
        fs::rename(&path, &quarantined).map_err(StoreError::io(&path))?;
        warn!(path = %path.display(), "quarantined corrupt partition file");
        Ok(quarantined)
    }
}

/// Iterator returned by [`StorageEngine::read`].
///
/// Yields `Err` at most once; after an error the iterator is exhausted.
pub struct RangeRead {
    paths: VecDeque<PathBuf>,
    start: NaiveDateTime,
    end: NaiveDateTime,
    current: std::vec::IntoIter<Bar>,
}

impl Iterator for RangeRead {
    type Item = Result<Bar, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for bar in self.current.by_ref() {
                if bar.timestamp < self.start {
                    continue;
                }
                if bar.timestamp > self.end {
                    self.paths.clear();
                    return None;
                }
                return Some(Ok(bar));
            }
            let path = self.paths.pop_front()?;
            match codec::read_file(&path) {
                Ok(Some(rows)) => self.current = rows.into_iter(),
                Ok(None) => {}
                Err(e) => {
                    self.paths.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}
