//! Schema migrations: repartition and/or transform every dataset.
//!
//! Each dataset is rewritten in its own transaction, so one dataset failing
//! (in its transform or mid-commit) leaves every other dataset migrated and
//! itself untouched. Datasets already at the target version are skipped.
//!
//! After a repartitioning migration, open the store with the target
//! scheme; range reads compute partitions from the scheme in use.

use crate::domain::{Bar, DatasetKey};
use crate::error::StoreError;
use crate::metadata::{DatasetExtent, MetadataRecord};
use crate::partition::{PartitionKey, PartitionScheme};
use crate::storage::normalize;
use crate::transaction::{DeletePartition, PutMetadata, TransactionCoordinator, WritePartition};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub type RowTransform = Box<dyn Fn(&DatasetKey, Vec<Bar>) -> Result<Vec<Bar>, StoreError> + Send + Sync>;

pub struct SchemaMigration {
    pub name: String,
    pub target_version: u32,
    /// Repartition into this scheme; `None` keeps the current one.
    pub target_scheme: Option<PartitionScheme>,
    pub transform: Option<RowTransform>,
}

impl SchemaMigration {
    pub fn new(name: impl Into<String>, target_version: u32) -> Self {
        Self {
            name: name.into(),
            target_version,
            target_scheme: None,
            transform: None,
        }
    }

    pub fn repartition(mut self, scheme: PartitionScheme) -> Self {
        self.target_scheme = Some(scheme);
        self
    }

    pub fn transform<F>(mut self, f: F) -> Self
    where
        F: Fn(&DatasetKey, Vec<Bar>) -> Result<Vec<Bar>, StoreError> + Send + Sync + 'static,
    {
        self.transform = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated {
        rows: usize,
        partitions_before: usize,
        partitions_after: usize,
    },
    Skipped {
        version: u32,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone)]
pub struct DatasetMigration {
    pub key: DatasetKey,
    pub outcome: MigrationOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    pub datasets: Vec<DatasetMigration>,
}

impl MigrationReport {
    fn count(&self, pred: impl Fn(&MigrationOutcome) -> bool) -> usize {
        self.datasets.iter().filter(|d| pred(&d.outcome)).count()
    }

    pub fn migrated(&self) -> usize {
        self.count(|o| matches!(o, MigrationOutcome::Migrated { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, MigrationOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, MigrationOutcome::Failed { .. }))
    }

    pub fn outcome_for(&self, key: &DatasetKey) -> Option<&MigrationOutcome> {
        self.datasets.iter().find(|d| &d.key == key).map(|d| &d.outcome)
    }
}

pub struct SchemaMigrator {
    coordinator: TransactionCoordinator,
}

impl SchemaMigrator {
    pub fn new(coordinator: TransactionCoordinator) -> Self {
        Self { coordinator }
    }

    /// Migrate every stored dataset.
    pub fn run(&self, migration: &SchemaMigration) -> Result<MigrationReport, StoreError> {
        let keys = self.coordinator.engine().list_keys()?;
        Ok(self.run_for(migration, &keys))
    }

    pub fn run_for(&self, migration: &SchemaMigration, keys: &[DatasetKey]) -> MigrationReport {
        let mut report = MigrationReport::default();
        for key in keys {
            let outcome = match self.migrate_one(migration, key) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(migration = %migration.name, key = %key, error = %e, "dataset migration failed");
                    MigrationOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            report.datasets.push(DatasetMigration {
                key: key.clone(),
                outcome,
            });
        }
        info!(
            migration = %migration.name,
            migrated = report.migrated(),
            skipped = report.skipped(),
            failed = report.failed(),
            "migration finished"
        );
        report
    }

    fn migrate_one(
        &self,
        migration: &SchemaMigration,
        key: &DatasetKey,
    ) -> Result<MigrationOutcome, StoreError> {
        let engine = self.coordinator.engine();
        let metadata = self.coordinator.metadata();

        // Held across read and commit; the commit re-enters it.
        let _guard = engine.lock_dataset(key)?;

        let existing = metadata.get(key)?;
        if let Some(record) = &existing {
            if record.schema_version >= migration.target_version {
                return Ok(MigrationOutcome::Skipped {
                    version: record.schema_version,
                });
            }
        }

        let before = engine.list_partitions(key)?;
        let mut bars = engine.read_all(key)?;
        if let Some(transform) = &migration.transform {
            bars = transform(key, bars)?;
        }
        let bars = normalize(bars);

        let scheme = migration.target_scheme.as_ref().unwrap_or(engine.scheme());
        let granularity = scheme.granularity_for(key.frequency);
        let mut groups: BTreeMap<PartitionKey, Vec<Bar>> = BTreeMap::new();
        for bar in &bars {
            groups
                .entry(PartitionKey::for_timestamp(bar.timestamp, granularity))
                .or_default()
                .push(*bar);
        }

        let timestamps: Vec<_> = bars.iter().map(|b| b.timestamp).collect();
        let extent = DatasetExtent::of_sorted(&timestamps);
        let mut record = existing.unwrap_or_else(|| MetadataRecord::new(key.clone(), metadata.now()));
        record.first_timestamp = extent.first_timestamp;
        record.last_timestamp = extent.last_timestamp;
        record.row_count = extent.row_count;
        record.schema_version = migration.target_version;
        record.updated_at = metadata.now();

        let partitions_after = groups.len();
        let mut tx = self.coordinator.begin();
        for partition in &before {
            tx.add_operation(DeletePartition::new(key.clone(), *partition));
        }
        for (partition, rows) in groups {
            tx.add_operation(WritePartition::new(key.clone(), partition, rows));
        }
        tx.add_operation(PutMetadata::new(key.clone(), Some(record)));
        self.coordinator.commit(&mut tx)?;

        Ok(MigrationOutcome::Migrated {
            rows: bars.len(),
            partitions_before: before.len(),
            partitions_after,
        })
    }
}
