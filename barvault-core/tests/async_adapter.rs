//! Integration tests for the tokio adapter: shared on-disk format with the
//! blocking engine, and copying between backends.

use barvault_core::asyncio::{AsyncStorageAdapter, BlockingAsyncStorage, NoProgress, StorageMigrator};
use barvault_core::domain::{Bar, DatasetKey, Frequency};
use barvault_core::error::StoreError;
use barvault_core::partition::{PartitionLevel, PartitionScheme};
use barvault_core::clock::FixedClock;
use barvault_core::fetch::SyntheticFetcher;
use barvault_core::gaps::Gap;
use barvault_core::metadata::{MetadataRecord, MetadataTracker};
use barvault_core::storage::{StorageBackend, StorageEngine, WriteStats};
use barvault_core::update::{UpdateManager, UpdateRequest, UpdateSettings, UpdateStrategy};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::sync::Arc;

fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 30)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn key(symbol: &str) -> DatasetKey {
    DatasetKey::new("test", Frequency::Minute5, symbol).unwrap()
}

fn bars(n: i64) -> Vec<Bar> {
    (0..n)
        .map(|i| Bar::flat(t0() + Duration::minutes(5 * i), 10.0 + i as f64, 1.0))
        .collect()
}

#[tokio::test]
async fn adapter_files_read_back_through_the_blocking_engine() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = AsyncStorageAdapter::new(dir.path());
    // Fifty hours of bars, so three daily partitions.
    let written = bars(600);
    adapter.write(&key("A"), written.clone()).await.unwrap();

    let base = dir.path().to_path_buf();
    let (read, partitions) = tokio::task::spawn_blocking(move || {
        let engine = StorageEngine::new(base);
        (
            engine.read_all(&key("A")).unwrap(),
            engine.list_partitions(&key("A")).unwrap(),
        )
    })
    .await
    .unwrap();

    assert_eq!(read, written);
    assert_eq!(partitions.len(), 3);
    assert_eq!(
        partitions,
        adapter.list_partitions(&key("A")).await.unwrap()
    );
}

#[tokio::test]
async fn blocking_engine_files_read_back_through_the_adapter() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_path_buf();
    let written = tokio::task::spawn_blocking(move || {
        let engine = StorageEngine::new(base);
        engine.write(&key("A"), bars(10)).unwrap();
        engine.read_all(&key("A")).unwrap()
    })
    .await
    .unwrap();

    let adapter = AsyncStorageAdapter::new(dir.path());
    let start = t0() + Duration::minutes(10);
    let end = t0() + Duration::minutes(20);
    let range = adapter.read_range(&key("A"), start, end).await.unwrap();
    assert_eq!(range, written[2..=4].to_vec());

    // The adapter's merge agrees with the engine's: one update, one insert.
    let stats = adapter
        .write(
            &key("A"),
            vec![
                Bar::flat(t0(), 99.0, 1.0),
                Bar::flat(t0() + Duration::minutes(50), 20.0, 1.0),
            ],
        )
        .await
        .unwrap();
    assert_eq!((stats.inserted, stats.updated), (1, 1));
}

#[tokio::test]
async fn adapter_honours_a_custom_scheme() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = AsyncStorageAdapter::new(dir.path())
        .with_scheme(PartitionScheme::new().with_override(Frequency::Minute5, PartitionLevel::Hour));
    adapter.write(&key("A"), bars(24)).await.unwrap();
    assert_eq!(adapter.list_partitions(&key("A")).await.unwrap().len(), 2);
    assert!(dir
        .path()
        .join("test/5min/year=2024/month=05/day=30/hour=01/A/data.parquet")
        .exists());
}

#[tokio::test]
async fn reading_a_missing_dataset_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = AsyncStorageAdapter::new(dir.path());
    assert!(adapter.read_all(&key("NONE")).await.unwrap().is_empty());
    assert!(!adapter.exists(&key("NONE")).await.unwrap());
    assert_eq!(adapter.delete(&key("NONE")).await.unwrap(), 0);
}

// ── Backend-to-backend copy ─────────────────────────────────────────

/// Engine that refuses writes for one symbol.
struct Refusing {
    inner: StorageEngine,
    symbol: &'static str,
}

impl StorageBackend for Refusing {
    fn name(&self) -> &str {
        "refusing"
    }

    fn write(&self, key: &DatasetKey, bars: Vec<Bar>) -> Result<WriteStats, StoreError> {
        if key.symbol == self.symbol {
            return Err(StoreError::Runtime("read-only".into()));
        }
        self.inner.write(key, bars)
    }

    fn read_range(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, StoreError> {
        self.inner.read_range(key, start, end)
    }

    fn read_all(&self, key: &DatasetKey) -> Result<Vec<Bar>, StoreError> {
        self.inner.read_all(key)
    }

    fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError> {
        self.inner.list_keys()
    }

    fn exists(&self, key: &DatasetKey) -> Result<bool, StoreError> {
        self.inner.exists(key)
    }

    fn delete(&self, key: &DatasetKey) -> Result<usize, StoreError> {
        self.inner.delete(key)
    }

    fn read_metadata(&self, key: &DatasetKey) -> Result<Option<MetadataRecord>, StoreError> {
        self.inner.read_metadata(key)
    }

    fn write_metadata(&self, key: &DatasetKey, record: &MetadataRecord) -> Result<(), StoreError> {
        self.inner.write_metadata(key, record)
    }
}

#[test]
fn async_store_copies_into_the_blocking_engine() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let source = BlockingAsyncStorage::new(AsyncStorageAdapter::new(src_dir.path()));
    source.write(&key("A"), bars(40)).unwrap();
    source.write(&key("B"), bars(7)).unwrap();
    let mut record = MetadataRecord::new(key("A"), t0());
    record.row_count = 40;
    record.first_timestamp = Some(t0());
    record.last_timestamp = bars(40).last().map(|b| b.timestamp);
    record.known_gaps.push(Gap {
        start: t0(),
        end: t0() + Duration::minutes(15),
        missing_count: 2,
    });
    source.write_metadata(&key("A"), &record).unwrap();

    let target = StorageEngine::new(dst_dir.path());
    let summary = StorageMigrator::new(Arc::new(source), Arc::new(target.clone()))
        .migrate_all(&NoProgress)
        .unwrap();

    assert!(summary.all_succeeded());
    assert_eq!((summary.total, summary.rows_copied), (2, 47));
    assert_eq!(target.read_all(&key("A")).unwrap(), bars(40));

    let tracker = MetadataTracker::new(&target, Arc::new(FixedClock::new(t0())));
    assert_eq!(tracker.get(&key("A")).unwrap(), Some(record));
    assert_eq!(tracker.get(&key("B")).unwrap(), None);
}

#[test]
fn migrated_dataset_resumes_incrementally_instead_of_bootstrapping() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let daily = DatasetKey::new("synthetic", Frequency::Daily, "SPY").unwrap();
    let clock = Arc::new(FixedClock::new(t0()));
    let settings = UpdateSettings {
        bootstrap_start: t0() - Duration::days(20),
        ..UpdateSettings::default()
    };
    let source = UpdateManager::new(StorageEngine::new(src_dir.path()), clock.clone())
        .with_settings(settings.clone())
        .with_fetcher("synthetic", Arc::new(SyntheticFetcher::default()));
    let request = UpdateRequest::new(daily.clone(), UpdateStrategy::Incremental);
    assert!(source.update(&request).success);
    let before = source.metadata().get(&daily).unwrap().unwrap();

    let target = BlockingAsyncStorage::new(AsyncStorageAdapter::new(dst_dir.path()));
    let summary = StorageMigrator::new(Arc::new(source.engine().clone()), Arc::new(target.clone()))
        .migrate_all(&NoProgress)
        .unwrap();
    assert!(summary.all_succeeded());
    assert_eq!(target.read_metadata(&daily).unwrap(), Some(before.clone()));

    let resumed = UpdateManager::new(StorageEngine::new(dst_dir.path()), clock)
        .with_settings(settings)
        .with_fetcher("synthetic", Arc::new(SyntheticFetcher::default()));
    let result = resumed.update(&request);
    assert!(result.success, "{result}");
    assert_eq!(result.rows_added, 0);
    let after = resumed.metadata().get(&daily).unwrap().unwrap();
    assert_eq!(after.update_history.len(), before.update_history.len() + 1);
    assert_eq!(after.row_count, before.row_count);
}

#[test]
fn one_failing_key_does_not_stop_the_copy() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let source = StorageEngine::new(src_dir.path());
    for symbol in ["A", "B", "C"] {
        source.write(&key(symbol), bars(3)).unwrap();
    }

    let target = Refusing {
        inner: StorageEngine::new(dst_dir.path()),
        symbol: "B",
    };
    let summary = StorageMigrator::new(Arc::new(source), Arc::new(target))
        .with_batch_size(1)
        .migrate_all(&NoProgress)
        .unwrap();

    assert_eq!((summary.succeeded, summary.failed), (2, 1));
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].0, key("B"));
    assert_eq!(summary.rows_copied, 6);
}
