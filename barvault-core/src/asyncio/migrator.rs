//! Copy datasets between two storage backends.

use crate::domain::DatasetKey;
use crate::error::StoreError;
use crate::metadata::DatasetExtent;
use crate::storage::StorageBackend;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Callback for batch-level progress.
pub trait MigrationProgress: Send + Sync {
    /// Called after each batch with that batch's (successful, failed) counts.
    fn on_batch_complete(&self, batch: usize, batches: usize, succeeded: usize, failed: usize);
}

impl<F> MigrationProgress for F
where
    F: Fn(usize, usize, usize, usize) + Send + Sync,
{
    fn on_batch_complete(&self, batch: usize, batches: usize, succeeded: usize, failed: usize) {
        self(batch, batches, succeeded, failed)
    }
}

/// Progress sink that ignores everything.
pub struct NoProgress;

impl MigrationProgress for NoProgress {
    fn on_batch_complete(&self, _: usize, _: usize, _: usize, _: usize) {}
}

#[derive(Debug)]
pub struct CopySummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_copied: usize,
    pub errors: Vec<(DatasetKey, StoreError)>,
}

impl CopySummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

pub struct StorageMigrator {
    source: Arc<dyn StorageBackend>,
    target: Arc<dyn StorageBackend>,
    batch_size: usize,
}

impl StorageMigrator {
    pub fn new(source: Arc<dyn StorageBackend>, target: Arc<dyn StorageBackend>) -> Self {
        Self {
            source,
            target,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Copy every key the source lists.
    pub fn migrate_all(&self, progress: &dyn MigrationProgress) -> Result<CopySummary, StoreError> {
        let keys = self.source.list_keys()?;
        Ok(self.migrate(&keys, progress))
    }

    /// Copy `keys`. A key that fails is reported and the rest continue.
    pub fn migrate(&self, keys: &[DatasetKey], progress: &dyn MigrationProgress) -> CopySummary {
        let mut summary = CopySummary {
            total: keys.len(),
            succeeded: 0,
            failed: 0,
            rows_copied: 0,
            errors: Vec::new(),
        };
        let batches = keys.len().div_ceil(self.batch_size);

        for (index, batch) in keys.chunks(self.batch_size).enumerate() {
            let (mut ok, mut failed) = (0, 0);
            for key in batch {
                match self.copy_one(key) {
                    Ok(rows) => {
                        ok += 1;
                        summary.rows_copied += rows;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "copy failed");
                        failed += 1;
                        summary.errors.push((key.clone(), e));
                    }
                }
            }
            summary.succeeded += ok;
            summary.failed += failed;
            progress.on_batch_complete(index, batches, ok, failed);
        }

        info!(
            source = self.source.name(),
            target = self.target.name(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            rows = summary.rows_copied,
            "storage migration finished"
        );
        summary
    }

    /// Copy one key and check the target holds at least as many rows in
    /// the copied range as the source had. The metadata sidecar follows the
    /// rows, with its extent taken from what the target now stores.
    fn copy_one(&self, key: &DatasetKey) -> Result<usize, StoreError> {
        let bars = self.source.read_all(key)?;
        let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
            return Ok(0);
        };
        let (start, end) = (first.timestamp, last.timestamp);
        let expected = bars.len();
        let record = self.source.read_metadata(key)?;
        self.target.write(key, bars)?;

        let copied = self.target.read_range(key, start, end)?.len();
        if copied < expected {
            return Err(StoreError::Runtime(format!(
                "{key}: copied {copied} of {expected} rows"
            )));
        }

        if let Some(mut record) = record {
            let stored: Vec<_> = self
                .target
                .read_all(key)?
                .into_iter()
                .map(|b| b.timestamp)
                .collect();
            record.set_extent(DatasetExtent::of_sorted(&stored));
            self.target.write_metadata(key, &record)?;
        }
        Ok(expected)
    }
}
