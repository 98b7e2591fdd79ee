//! Tokio sibling of [`StorageEngine`](crate::storage::StorageEngine).
//!
//! Same layout, same parquet encoding and the same lock files, so the two
//! engines can share a base directory. File I/O goes through `tokio::fs`;
//! directory walks run on the blocking pool.
//!
//! Locking happens in two steps. A process-wide `tokio::sync::Mutex` per
//! lock file queues tasks of this process without polling. The holder then
//! takes the `flock` on the shared lock file, retrying with
//! `tokio::time::sleep` while the blocking engine (or another process)
//! holds it.

use crate::codec;
use crate::domain::{Bar, DatasetKey};
use crate::error::StoreError;
use crate::lock::{lock_path_for, FileLock, LockToken, DEFAULT_LOCK_TTL};
use crate::metadata::MetadataRecord;
use crate::partition::{PartitionKey, PartitionScheme};
use crate::storage::atomic::{tmp_path_for, TempFileGuard};
use crate::storage::layout::prune_empty_dirs;
use crate::storage::{
    dataset_lock_name, merge, normalize, partition_lock_name, Layout, WriteStats,
    DEFAULT_LOCK_TIMEOUT, MAX_ENUMERATED_PARTITIONS,
};
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const POLL_JITTER_MS: u64 = 10;

type KeyMutexes = Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>;

static KEY_MUTEXES: OnceLock<KeyMutexes> = OnceLock::new();

/// One queue per lock file, so stores under different base directories
/// never wait on each other.
fn key_mutex(path: &Path) -> Arc<tokio::sync::Mutex<()>> {
    KEY_MUTEXES
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .entry(path.to_path_buf())
        .or_default()
        .clone()
}

/// Held lock: the in-process queue slot plus the OS lock. Released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncLockGuard {
    _file: FileLock,
    _slot: OwnedMutexGuard<()>,
}

#[derive(Debug, Clone)]
pub struct AsyncStorageAdapter {
    layout: Layout,
    scheme: PartitionScheme,
    lock_timeout: Duration,
}

impl AsyncStorageAdapter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::new(base),
            scheme: PartitionScheme::default(),
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

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    async fn acquire(&self, name: &str, deadline: Instant) -> Result<AsyncLockGuard, StoreError> {
        let started = Instant::now();
        let timed_out = || StoreError::LockAcquisition {
            key: name.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        };

        let lock_dir = self.layout.lock_dir();
        let path = lock_path_for(&lock_dir, name);
        let remaining = deadline.saturating_duration_since(started);
        let slot = tokio::time::timeout(remaining, key_mutex(&path).lock_owned())
            .await
            .map_err(|_| timed_out())?;

        tokio::fs::create_dir_all(&lock_dir)
            .await
            .map_err(StoreError::io(&lock_dir))?;
        // Opened once; only the non-blocking flock is retried.
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(StoreError::io(&path))?
            .into_std()
            .await;

        loop {
            match FileLock::try_lock(file, &path) {
                Ok(Ok(mut lock)) => {
                    let token = LockToken::new(name, &path, DEFAULT_LOCK_TTL);
                    if let Err(e) = lock.write_token(&token) {
                        debug!(key = name, error = %e, "could not record lock token");
                    }
                    return Ok(AsyncLockGuard {
                        _file: lock,
                        _slot: slot,
                    });
                }
                Ok(Err(returned)) => file = returned,
                Err(e) => return Err(StoreError::io(&path)(e)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=POLL_JITTER_MS));
            tokio::time::sleep((deadline - now).min(POLL_INTERVAL + jitter)).await;
        }
    }

    /// Hold the dataset lock, excluding the blocking engine and other
    /// processes as well as other tasks. Not reentrant: do not call
    /// mutating methods for `key` while holding it.
    pub async fn lock_dataset(&self, key: &DatasetKey) -> Result<AsyncLockGuard, StoreError> {
        self.acquire(&dataset_lock_name(key), Instant::now() + self.lock_timeout)
            .await
    }

    async fn lock_partition(
        &self,
        key: &DatasetKey,
        partition: &PartitionKey,
    ) -> Result<AsyncLockGuard, StoreError> {
        self.acquire(
            &partition_lock_name(key, partition),
            Instant::now() + self.lock_timeout,
        )
        .await
    }

    /// Merge `batch` into the stored dataset.
    pub async fn write(&self, key: &DatasetKey, batch: Vec<Bar>) -> Result<WriteStats, StoreError> {
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

        let _dataset = self.lock_dataset(key).await?;
        for (partition, rows) in groups {
            let _partition = self.lock_partition(key, &partition).await?;
            let path = self.layout.partition_file(key, &partition);
            let existing = read_file(&path).await?.unwrap_or_default();
            let (merged, merge_stats) = merge(&existing, &rows);
            stats.inserted += merge_stats.inserted;
            stats.updated += merge_stats.updated;
            stats.unchanged += merge_stats.unchanged;
            if merge_stats.changed() {
                write_atomic(&path, &codec::encode(&merged)?).await?;
                stats.partitions_written += 1;
            }
        }

        debug!(
            key = %key,
            inserted = stats.inserted,
            updated = stats.updated,
            partitions = stats.partitions_written,
            "async write complete"
        );
        Ok(stats)
    }

    /// Rows in `[start, end]`, in timestamp order. Takes no locks.
    pub async fn read_range(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, StoreError> {
        let partitions = match self.scheme.partitions_between_bounded(
            start,
            end,
            key.frequency,
            MAX_ENUMERATED_PARTITIONS,
        ) {
            Some(partitions) => partitions,
            None => self.scheme.retain_between(
                self.list_partitions(key).await?,
                start,
                end,
                key.frequency,
            ),
        };
        let mut bars = Vec::new();
        for partition in partitions {
            if let Some(rows) = read_file(&self.layout.partition_file(key, &partition)).await? {
                bars.extend(
                    rows.into_iter()
                        .filter(|b| start <= b.timestamp && b.timestamp <= end),
                );
            }
        }
        Ok(bars)
    }

    pub async fn read_all(&self, key: &DatasetKey) -> Result<Vec<Bar>, StoreError> {
        let mut bars = Vec::new();
        for partition in self.list_partitions(key).await? {
            if let Some(rows) = read_file(&self.layout.partition_file(key, &partition)).await? {
                bars.extend(rows);
            }
        }
        Ok(bars)
    }

    /// The dataset's `.metadata.json` sidecar, if any.
    pub async fn read_metadata(
        &self,
        key: &DatasetKey,
    ) -> Result<Option<MetadataRecord>, StoreError> {
        let path = self.layout.metadata_file(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path)(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Metadata(format!("{}: {e}", path.display())))
    }

    pub async fn write_metadata(
        &self,
        key: &DatasetKey,
        record: &MetadataRecord,
    ) -> Result<(), StoreError> {
        let path = self.layout.metadata_file(key);
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Metadata(format!("serialize {}: {e}", path.display())))?;
        let _dataset = self.lock_dataset(key).await?;
        write_atomic(&path, &json).await
    }

    pub async fn list_partitions(&self, key: &DatasetKey) -> Result<Vec<PartitionKey>, StoreError> {
        let layout = self.layout.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || layout.list_partitions(&key))
            .await
            .map_err(|e| StoreError::Runtime(format!("partition listing task: {e}")))?
    }

    pub async fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError> {
        let layout = self.layout.clone();
        tokio::task::spawn_blocking(move || layout.list_keys())
            .await
            .map_err(|e| StoreError::Runtime(format!("key listing task: {e}")))?
    }

    pub async fn exists(&self, key: &DatasetKey) -> Result<bool, StoreError> {
        Ok(!self.list_partitions(key).await?.is_empty())
    }

    /// Remove every partition of `key`. Returns the number removed.
    pub async fn delete(&self, key: &DatasetKey) -> Result<usize, StoreError> {
        let _dataset = self.lock_dataset(key).await?;
        let mut removed = 0;
        for partition in self.list_partitions(key).await? {
            let _partition = self.lock_partition(key, &partition).await?;
            let path = self.layout.partition_file(key, &partition);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    removed += 1;
                    let dir = self.layout.partition_dir(key, &partition);
                    sync_dir(&dir).await?;
                    prune_empty_dirs(&dir, &self.layout.frequency_root(key));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path)(e)),
            }
        }
        debug!(key = %key, partitions = removed, "async delete complete");
        Ok(removed)
    }
}

async fn read_file(path: &Path) -> Result<Option<Vec<Bar>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => codec::decode(bytes)
            .map(Some)
            .map_err(|e| StoreError::Parquet(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path)(e)),
    }
}

async fn write_atomic(target: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(StoreError::io(parent))?;

    let tmp = tmp_path_for(target);
    let mut guard = TempFileGuard::new(tmp.clone());
    {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(StoreError::io(&tmp))?;
        file.write_all(contents).await.map_err(StoreError::io(&tmp))?;
        file.sync_all().await.map_err(StoreError::io(&tmp))?;
    }
    tokio::fs::rename(&tmp, target)
        .await
        .map_err(StoreError::io(target))?;
    guard.disarm();

    sync_dir(parent).await
}

async fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    let handle = tokio::fs::File::open(dir).await.map_err(StoreError::io(dir))?;
    handle.sync_all().await.map_err(StoreError::io(dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Frequency;
    use chrono::NaiveDate;

    fn day(m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn key() -> DatasetKey {
        DatasetKey::new("test", Frequency::Daily, "QQQ").unwrap()
    }

    #[tokio::test]
    async fn write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = AsyncStorageAdapter::new(dir.path());
        let bars = vec![
            Bar::flat(day(2, 1), 2.0, 10.0),
            Bar::flat(day(1, 31), 1.0, 10.0),
        ];
        let stats = adapter.write(&key(), bars).await.unwrap();
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.partitions_written, 2);

        let read = adapter.read_range(&key(), day(1, 1), day(12, 31)).await.unwrap();
        assert_eq!(read.len(), 2);
        assert!(read[0].timestamp < read[1].timestamp);
        assert_eq!(adapter.list_keys().await.unwrap(), vec![key()]);

        assert_eq!(adapter.delete(&key()).await.unwrap(), 2);
        assert!(!adapter.exists(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn read_to_the_end_of_time_lists_partitions_instead() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = AsyncStorageAdapter::new(dir.path());
        adapter
            .write(&key(), vec![Bar::flat(day(5, 1), 1.0, 1.0)])
            .await
            .unwrap();
        let read = adapter
            .read_range(&key(), day(1, 1), NaiveDateTime::MAX)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn rewrite_of_identical_rows_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = AsyncStorageAdapter::new(dir.path());
        let bars = vec![Bar::flat(day(3, 4), 5.0, 1.0)];
        adapter.write(&key(), bars.clone()).await.unwrap();
        let again = adapter.write(&key(), bars).await.unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.partitions_written, 0);
    }

    #[tokio::test]
    async fn tasks_on_one_key_do_not_lose_rows() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = AsyncStorageAdapter::new(dir.path());
        let mut tasks = Vec::new();
        for i in 0..8u32 {
            let adapter = adapter.clone();
            tasks.push(tokio::spawn(async move {
                adapter
                    .write(&key(), vec![Bar::flat(day(5, i + 1), 1.0, 1.0)])
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(adapter.read_all(&key()).await.unwrap().len(), 8);
    }
}
