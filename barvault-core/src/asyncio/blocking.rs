use super::adapter::AsyncStorageAdapter;
use crate::domain::{Bar, DatasetKey};
use crate::error::StoreError;
use crate::metadata::MetadataRecord;
use crate::storage::{StorageBackend, WriteStats};
use chrono::NaiveDateTime;
use std::future::Future;

/// Blocking facade over [`AsyncStorageAdapter`].
///
/// Each call builds a current-thread runtime and blocks on it. Must not be
/// called from inside a running tokio runtime; doing so returns
/// [`StoreError::Runtime`] instead of deadlocking.
#[derive(Debug, Clone)]
pub struct BlockingAsyncStorage {
    adapter: AsyncStorageAdapter,
}

impl BlockingAsyncStorage {
    pub fn new(adapter: AsyncStorageAdapter) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &AsyncStorageAdapter {
        &self.adapter
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, StoreError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(StoreError::Runtime(
                "blocking storage called from inside a tokio runtime".into(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Runtime(format!("build runtime: {e}")))?;
        Ok(runtime.block_on(future))
    }
}

impl StorageBackend for BlockingAsyncStorage {
    fn name(&self) -> &str {
        "async"
    }

    fn write(&self, key: &DatasetKey, bars: Vec<Bar>) -> Result<WriteStats, StoreError> {
        self.block_on(self.adapter.write(key, bars))?
    }

    fn read_range(
        &self,
        key: &DatasetKey,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Bar>, StoreError> {
        self.block_on(self.adapter.read_range(key, start, end))?
    }

    fn read_all(&self, key: &DatasetKey) -> Result<Vec<Bar>, StoreError> {
        self.block_on(self.adapter.read_all(key))?
    }

    fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError> {
        self.block_on(self.adapter.list_keys())?
    }

    fn exists(&self, key: &DatasetKey) -> Result<bool, StoreError> {
        self.block_on(self.adapter.exists(key))?
    }

    fn delete(&self, key: &DatasetKey) -> Result<usize, StoreError> {
        self.block_on(self.adapter.delete(key))?
    }

    fn read_metadata(&self, key: &DatasetKey) -> Result<Option<MetadataRecord>, StoreError> {
        self.block_on(self.adapter.read_metadata(key))?
    }

    fn write_metadata(&self, key: &DatasetKey, record: &MetadataRecord) -> Result<(), StoreError> {
        self.block_on(self.adapter.write_metadata(key, record))?
    }
}
