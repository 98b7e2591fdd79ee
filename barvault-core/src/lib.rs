//! barvault core: a time-partitioned OHLCV store that keeps itself up to date.
//!
//! This crate contains:
//! - Partition scheme and on-disk layout (Hive-style parquet partitions)
//! - Blocking storage engine with atomic writes and merge-on-write dedup
//! - Cross-process, reentrant locking shared with the tokio adapter
//! - Per-dataset metadata sidecars with bounded update history and health
//! - Multi-step transactions with compensating rollback, and schema migration
//! - Gap detection against a trading calendar
//! - Update orchestration: incremental, append-only, full refresh, backfill
//! - Tokio storage adapter, its blocking facade, and a cross-backend migrator

pub mod asyncio;
pub mod clock;
pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod gaps;
pub mod lock;
pub mod metadata;
pub mod migration;
pub mod partition;
pub mod profile;
pub mod storage;
pub mod transaction;
pub mod update;
pub mod validation;

pub use asyncio::{AsyncStorageAdapter, BlockingAsyncStorage, StorageMigrator};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ConfigError, StoreConfig};
pub use domain::{Bar, DatasetKey, Frequency, TimeRange};
pub use error::{FailureKind, StoreError};
pub use fetch::{DataFetcher, FetchError};
pub use gaps::{Gap, GapDetector, MarketCalendar};
pub use lock::{LockGuard, LockManager};
pub use metadata::{Health, MetadataRecord, MetadataTracker};
pub use partition::{PartitionKey, PartitionLevel, PartitionScheme};
pub use storage::{StorageBackend, StorageEngine};
pub use transaction::{Transaction, TransactionCoordinator, TransactionError};
pub use update::{UpdateManager, UpdateRequest, UpdateResult, UpdateStrategy};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything shared across update threads is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send_sync<T: Send + Sync>() {}

        require_send_sync::<StorageEngine>();
        require_send_sync::<MetadataTracker>();
        require_send_sync::<TransactionCoordinator>();
        require_send_sync::<UpdateManager>();
        require_send_sync::<AsyncStorageAdapter>();
        require_send_sync::<StorageMigrator>();
        require_send_sync::<UpdateResult>();
        require_send_sync::<StoreError>();
    }
}
