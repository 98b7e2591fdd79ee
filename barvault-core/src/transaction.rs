//! Multi-step writes with compensating rollback.
//!
//! A [`Transaction`] is an ordered list of [`TxOperation`]s. `commit` locks
//! every dataset the operations touch (sorted, so two transactions can
//! never deadlock), applies the operations in order and, if one fails,
//! runs the compensations of the already-applied ones in reverse order.
//! Each built-in operation snapshots whatever it is about to overwrite
//! when it is applied, so compensation restores exactly that.

use crate::domain::{Bar, DatasetKey};
use crate::error::StoreError;
use crate::lock::LockGuard;
use crate::metadata::{MetadataRecord, MetadataTracker};
use crate::partition::PartitionKey;
use crate::storage::StorageEngine;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

static NEXT_TX: AtomicU64 = AtomicU64::new(1);

/// What operations get to touch while a transaction commits.
pub struct TxContext<'a> {
    pub engine: &'a StorageEngine,
    pub metadata: &'a MetadataTracker,
}

pub trait TxOperation: Send {
    fn describe(&self) -> String;

    /// Datasets this operation writes; their locks are held for the commit.
    fn datasets(&self) -> Vec<DatasetKey>;

    fn apply(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError>;

    /// Undo a successful `apply`.
    fn compensate(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError>;
}

/// Replace one partition's content.
pub struct WritePartition {
    key: DatasetKey,
    partition: PartitionKey,
    bars: Vec<Bar>,
    prior: Option<Option<Vec<Bar>>>,
}

impl WritePartition {
    pub fn new(key: DatasetKey, partition: PartitionKey, bars: Vec<Bar>) -> Self {
        Self {
            key,
            partition,
            bars,
            prior: None,
        }
    }
}

impl TxOperation for WritePartition {
    fn describe(&self) -> String {
        format!(
            "write {} rows to {}@{}",
            self.bars.len(),
            self.key,
            self.partition.relative_path().display()
        )
    }

    fn datasets(&self) -> Vec<DatasetKey> {
        vec![self.key.clone()]
    }

    fn apply(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError> {
        let prior = ctx.engine.read_partition(&self.key, &self.partition)?;
        ctx.engine
            .write_partition(&self.key, &self.partition, self.bars.clone())?;
        self.prior = Some(prior);
        Ok(())
    }

    fn compensate(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError> {
        match self.prior.take() {
            Some(Some(bars)) => ctx.engine.write_partition(&self.key, &self.partition, bars),
            Some(None) => ctx.engine.delete_partition(&self.key, &self.partition).map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Remove one partition.
pub struct DeletePartition {
    key: DatasetKey,
    partition: PartitionKey,
    prior: Option<Vec<Bar>>,
}

impl DeletePartition {
    pub fn new(key: DatasetKey, partition: PartitionKey) -> Self {
        Self {
            key,
            partition,
            prior: None,
        }
    }
}

impl TxOperation for DeletePartition {
    fn describe(&self) -> String {
        format!(
            "delete {}@{}",
            self.key,
            self.partition.relative_path().display()
        )
    }

    fn datasets(&self) -> Vec<DatasetKey> {
        vec![self.key.clone()]
    }

    fn apply(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError> {
        self.prior = ctx.engine.read_partition(&self.key, &self.partition)?;
        ctx.engine.delete_partition(&self.key, &self.partition)?;
        Ok(())
    }

    fn compensate(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError> {
        match self.prior.take() {
            Some(bars) => ctx.engine.write_partition(&self.key, &self.partition, bars),
            None => Ok(()),
        }
    }
}

/// Replace (or with `None`, remove) a dataset's metadata record.
pub struct PutMetadata {
    key: DatasetKey,
    record: Option<MetadataRecord>,
    prior: Option<Option<MetadataRecord>>,
}

impl PutMetadata {
    pub fn new(key: DatasetKey, record: Option<MetadataRecord>) -> Self {
        Self {
            key,
            record,
            prior: None,
        }
    }
}

impl TxOperation for PutMetadata {
    fn describe(&self) -> String {
        match &self.record {
            Some(r) => format!("put metadata for {} ({} rows)", self.key, r.row_count),
            None => format!("remove metadata for {}", self.key),
        }
    }

    fn datasets(&self) -> Vec<DatasetKey> {
        vec![self.key.clone()]
    }

    fn apply(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError> {
        let prior = ctx.metadata.get(&self.key)?;
        match &self.record {
            Some(record) => ctx.metadata.put(&self.key, record)?,
            None => {
                ctx.metadata.remove(&self.key)?;
            }
        }
        self.prior = Some(prior);
        Ok(())
    }

    fn compensate(&mut self, ctx: &TxContext<'_>) -> Result<(), StoreError> {
        match self.prior.take() {
            Some(Some(record)) => ctx.metadata.put(&self.key, &record),
            Some(None) => ctx.metadata.remove(&self.key).map(|_| ()),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Committing,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct CompensationFailure {
    pub index: usize,
    pub operation: String,
    pub message: String,
}

/// What rollback managed to undo.
#[derive(Debug, Clone, Default)]
pub struct RollbackOutcome {
    pub compensated: usize,
    pub failures: Vec<CompensationFailure>,
}

impl RollbackOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "rolled back {} operation(s)", self.compensated)
        } else {
            write!(
                f,
                "rollback incomplete ({} undone, {} failed: {})",
                self.compensated,
                self.failures.len(),
                self.failures
                    .iter()
                    .map(|c| format!("#{} {}: {}", c.index, c.operation, c.message))
                    .collect::<Vec<_>>()
                    .join("; ")
            )
        }
    }
}

#[derive(Debug, Error)]
#[error("transaction {tx_id} failed at step {failed_at} ({operation}): {cause}; {rollback}")]
pub struct TransactionError {
    pub tx_id: String,
    pub failed_at: usize,
    pub operation: String,
    #[source]
    pub cause: Box<StoreError>,
    pub rollback: RollbackOutcome,
}

pub struct Transaction {
    id: String,
    ops: Vec<Box<dyn TxOperation>>,
    state: TxState,
}

impl Transaction {
    fn new() -> Self {
        Self {
            id: format!("tx-{}", NEXT_TX.fetch_add(1, Ordering::Relaxed)),
            ops: Vec::new(),
            state: TxState::Pending,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn add_operation(&mut self, op: impl TxOperation + 'static) -> &mut Self {
        self.ops.push(Box::new(op));
        self
    }

    pub fn add_boxed(&mut self, op: Box<dyn TxOperation>) -> &mut Self {
        self.ops.push(op);
        self
    }

    fn datasets(&self) -> BTreeSet<DatasetKey> {
        self.ops.iter().flat_map(|op| op.datasets()).collect()
    }
}

#[derive(Clone)]
pub struct TransactionCoordinator {
    engine: StorageEngine,
    metadata: MetadataTracker,
}

impl TransactionCoordinator {
    pub fn new(engine: StorageEngine, metadata: MetadataTracker) -> Self {
        Self { engine, metadata }
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    pub fn metadata(&self) -> &MetadataTracker {
        &self.metadata
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new()
    }

    /// Apply every operation or none of them.
    ///
    /// A lock timeout before anything is applied is returned as-is (the
    /// transaction ends rolled back with nothing to undo).
    pub fn commit(&self, tx: &mut Transaction) -> Result<(), StoreError> {
        if tx.state != TxState::Pending {
            return Err(StoreError::Runtime(format!(
                "transaction {} is {:?}, not pending",
                tx.id, tx.state
            )));
        }
        tx.state = TxState::Committing;

        let mut guards: Vec<LockGuard> = Vec::new();
        for key in tx.datasets() {
            match self.engine.lock_dataset(&key) {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    tx.state = TxState::RolledBack;
                    return Err(e);
                }
            }
        }

        let ctx = TxContext {
            engine: &self.engine,
            metadata: &self.metadata,
        };

        for index in 0..tx.ops.len() {
            let result = guards
                .iter()
                .try_for_each(LockGuard::renew)
                .and_then(|()| tx.ops[index].apply(&ctx));
            if let Err(cause) = result {
                let operation = tx.ops[index].describe();
                warn!(tx = %tx.id, step = index, %operation, error = %cause, "transaction step failed, rolling back");
                let rollback = rollback(&mut tx.ops[..index], &ctx);
                tx.state = TxState::RolledBack;
                return Err(StoreError::Transaction(TransactionError {
                    tx_id: tx.id.clone(),
                    failed_at: index,
                    operation,
                    cause: Box::new(cause),
                    rollback,
                }));
            }
        }

        tx.state = TxState::Committed;
        debug!(tx = %tx.id, steps = tx.ops.len(), "transaction committed");
        Ok(())
    }
}

fn rollback(applied: &mut [Box<dyn TxOperation>], ctx: &TxContext<'_>) -> RollbackOutcome {
    let mut outcome = RollbackOutcome::default();
    for (index, op) in applied.iter_mut().enumerate().rev() {
        match op.compensate(ctx) {
            Ok(()) => outcome.compensated += 1,
            Err(e) => outcome.failures.push(CompensationFailure {
                index,
                operation: op.describe(),
                message: e.to_string(),
            }),
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::domain::Frequency;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::Arc;

    fn day(m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    struct Fails;

    impl TxOperation for Fails {
        fn describe(&self) -> String {
            "always fails".into()
        }
        fn datasets(&self) -> Vec<DatasetKey> {
            Vec::new()
        }
        fn apply(&mut self, _ctx: &TxContext<'_>) -> Result<(), StoreError> {
            Err(StoreError::Runtime("injected".into()))
        }
        fn compensate(&mut self, _ctx: &TxContext<'_>) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn coordinator(dir: &std::path::Path) -> TransactionCoordinator {
        let engine = StorageEngine::new(dir);
        let metadata = MetadataTracker::new(&engine, Arc::new(SystemClock));
        TransactionCoordinator::new(engine, metadata)
    }

    #[test]
    fn commits_all_operations() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let key = DatasetKey::new("t", Frequency::Daily, "A").unwrap();
        let jan = coord.engine().scheme().partition_for(day(1, 1), Frequency::Daily);
        let feb = coord.engine().scheme().partition_for(day(2, 1), Frequency::Daily);

        let mut tx = coord.begin();
        tx.add_operation(WritePartition::new(key.clone(), jan, vec![Bar::flat(day(1, 2), 1.0, 1.0)]))
            .add_operation(WritePartition::new(key.clone(), feb, vec![Bar::flat(day(2, 2), 2.0, 1.0)]));
        coord.commit(&mut tx).unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(coord.engine().read_all(&key).unwrap().len(), 2);
        assert!(coord.commit(&mut tx).is_err());
    }

    #[test]
    fn failure_rolls_back_applied_steps() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(dir.path());
        let key = DatasetKey::new("t", Frequency::Daily, "A").unwrap();
        let jan = coord.engine().scheme().partition_for(day(1, 1), Frequency::Daily);
        coord
            .engine()
            .write(&key, vec![Bar::flat(day(1, 2), 1.0, 1.0)])
            .unwrap();

        let mut tx = coord.begin();
        tx.add_operation(DeletePartition::new(key.clone(), jan))
            .add_operation(Fails);
        let err = coord.commit(&mut tx).unwrap_err();
        assert_eq!(tx.state(), TxState::RolledBack);
        match err {
            StoreError::Transaction(e) => {
                assert_eq!(e.failed_at, 1);
                assert_eq!(e.rollback.compensated, 1);
                assert!(e.rollback.is_clean());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            coord.engine().read_all(&key).unwrap(),
            vec![Bar::flat(day(1, 2), 1.0, 1.0)]
        );
    }
}
