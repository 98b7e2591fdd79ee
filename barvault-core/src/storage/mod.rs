//! Partitioned parquet storage.

pub mod atomic;
pub mod engine;
pub mod layout;
pub mod merge;

pub use engine::{
    dataset_lock_name, partition_lock_name, RangeRead, StorageEngine, WriteStats,
    DEFAULT_LOCK_TIMEOUT, MAX_ENUMERATED_PARTITIONS,
};
pub use layout::Layout;
pub use merge::{merge, normalize, MergeStats};

use crate::domain::{Bar, DatasetKey};
use crate::error::StoreError;
use crate::metadata::{self, MetadataRecord};
use chrono::NaiveDateTime;

/// The read/write/list/delete contract shared by the blocking engine and the
/// blocking facade over the async adapter. `StorageMigrator` copies between
/// any two of these, metadata sidecar included.
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, key: &DatasetKey, bars: Vec<Bar>) -> Result<WriteStats, StoreError>;

    fn read_range(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, StoreError>;

    fn read_all(&self, key: &DatasetKey) -> Result<Vec<Bar>, StoreError>;

    fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError>;

    fn exists(&self, key: &DatasetKey) -> Result<bool, StoreError>;

    /// Returns the number of partitions removed.
    fn delete(&self, key: &DatasetKey) -> Result<usize, StoreError>;

    fn read_metadata(&self, key: &DatasetKey) -> Result<Option<MetadataRecord>, StoreError>;

    /// Replace the `.metadata.json` sidecar under the dataset lock.
    fn write_metadata(&self, key: &DatasetKey, record: &MetadataRecord) -> Result<(), StoreError>;
}

impl StorageBackend for StorageEngine {
    fn name(&self) -> &str {
        "blocking"
    }

    fn write(&self, key: &DatasetKey, bars: Vec<Bar>) -> Result<WriteStats, StoreError> {
        StorageEngine::write(self, key, bars)
    }

    fn read_range(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, StoreError> {
        StorageEngine::read_range(self, key, start, end)
    }

    fn read_all(&self, key: &DatasetKey) -> Result<Vec<Bar>, StoreError> {
        StorageEngine::read_all(self, key)
    }

    fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError> {
        StorageEngine::list_keys(self)
    }

    fn exists(&self, key: &DatasetKey) -> Result<bool, StoreError> {
        StorageEngine::exists(self, key)
    }

    fn delete(&self, key: &DatasetKey) -> Result<usize, StoreError> {
        StorageEngine::delete(self, key)
    }

    fn read_metadata(&self, key: &DatasetKey) -> Result<Option<MetadataRecord>, StoreError> {
        metadata::read_json(&self.layout().metadata_file(key))
    }

    fn write_metadata(&self, key: &DatasetKey, record: &MetadataRecord) -> Result<(), StoreError> {
        let _guard = self.lock_dataset(key)?;
        metadata::write_json(&self.layout().metadata_file(key), record)
    }
}
