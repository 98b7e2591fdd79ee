//! Cooperative (tokio) storage and cross-backend copying.

pub mod adapter;
pub mod blocking;
pub mod migrator;

pub use adapter::{AsyncLockGuard, AsyncStorageAdapter};
pub use blocking::BlockingAsyncStorage;
pub use migrator::{CopySummary, MigrationProgress, NoProgress, StorageMigrator, DEFAULT_BATCH_SIZE};
