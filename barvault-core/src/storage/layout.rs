//! On-disk layout.
//!
//! ```text
//! {base}/{provider}/{frequency}/year=YYYY/month=MM[/day=DD][/hour=HH]/{symbol}/data.parquet
//! {base}/{provider}/{frequency}/{symbol}/.metadata.json
//! {base}/{provider}/{frequency}/{symbol}/.profile.json
//! {base}/.locks/{blake3(lock name)}.lock
//! ```
//!
//! Partition directories contain `=`; symbols never do, which is what lets
//! a directory walk tell them apart.

use crate::domain::{DatasetKey, Frequency};
use crate::error::StoreError;
use crate::partition::PartitionKey;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DATA_FILE: &str = "data.parquet";
pub const QUARANTINE_FILE: &str = "data.parquet.quarantined";
pub const METADATA_FILE: &str = ".metadata.json";
pub const PROFILE_FILE: &str = ".profile.json";
pub const LOCK_DIR: &str = ".locks";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    base: PathBuf,
}

impl Layout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.base.join(LOCK_DIR)
    }

    /// `{base}/{provider}/{frequency}`, shared by every symbol.
    pub fn frequency_root(&self, key: &DatasetKey) -> PathBuf {
        self.base.join(&key.provider).join(key.frequency.as_str())
    }

    pub fn partition_dir(&self, key: &DatasetKey, partition: &PartitionKey) -> PathBuf {
        self.frequency_root(key)
            .join(partition.relative_path())
            .join(&key.symbol)
    }

    pub fn partition_file(&self, key: &DatasetKey, partition: &PartitionKey) -> PathBuf {
        self.partition_dir(key, partition).join(DATA_FILE)
    }

    pub fn sidecar_dir(&self, key: &DatasetKey) -> PathBuf {
        self.frequency_root(key).join(&key.symbol)
    }

    pub fn metadata_file(&self, key: &DatasetKey) -> PathBuf {
        self.sidecar_dir(key).join(METADATA_FILE)
    }

    pub fn profile_file(&self, key: &DatasetKey) -> PathBuf {
        self.sidecar_dir(key).join(PROFILE_FILE)
    }

    /// Partitions holding a data file for `key`, in time order.
    pub fn list_partitions(&self, key: &DatasetKey) -> Result<Vec<PartitionKey>, StoreError> {
        let mut found = BTreeSet::new();
        walk_partitions(&self.frequency_root(key), &mut Vec::new(), &mut |components: &[String], dir: &Path| {
            if dir.join(&key.symbol).join(DATA_FILE).is_file() {
                if let Some(partition) = PartitionKey::from_components(components) {
                    found.insert(partition);
                }
            }
            Ok(())
        })?;
        Ok(found.into_iter().collect())
    }

    /// Every dataset with at least one partition file.
    pub fn list_keys(&self) -> Result<Vec<DatasetKey>, StoreError> {
        let mut keys = BTreeSet::new();
        for provider in subdirs(&self.base)? {
            if provider.starts_with('.') {
                continue;
            }
            let provider_dir = self.base.join(&provider);
            for freq_name in subdirs(&provider_dir)? {
                let Ok(frequency) = freq_name.parse::<Frequency>() else {
                    continue;
                };
                // Aliases like "1d" would map to a second directory name.
                if frequency.as_str() != freq_name {
                    continue;
                }
                let root = provider_dir.join(&freq_name);
                walk_partitions(&root, &mut Vec::new(), &mut |components: &[String], dir: &Path| {
                    if PartitionKey::from_components(components).is_none() {
                        return Ok(());
                    }
                    for symbol in subdirs(dir)? {
                        if symbol.contains('=') || !dir.join(&symbol).join(DATA_FILE).is_file() {
                            continue;
                        }
                        if let Ok(key) = DatasetKey::new(provider.as_str(), frequency, symbol) {
                            keys.insert(key);
                        }
                    }
                    Ok(())
                })?;
            }
        }
        Ok(keys.into_iter().collect())
    }
}

/// Names of the immediate subdirectories of `dir`; empty if it is missing.
fn subdirs(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir)(e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(StoreError::io(dir))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Depth-first walk over `name=value` directories below `dir`, calling
/// `visit` for every such directory with the components leading to it.
fn walk_partitions(
    dir: &Path,
    components: &mut Vec<String>,
    visit: &mut dyn FnMut(&[String], &Path) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    for name in subdirs(dir)? {
        if !name.contains('=') {
            continue;
        }
        let child = dir.join(&name);
        components.push(name);
        visit(components.as_slice(), &child)?;
        walk_partitions(&child, components, visit)?;
        components.pop();
    }
    Ok(())
}

/// Remove `dir` and then each empty ancestor up to (not including) `stop`.
pub(crate) fn prune_empty_dirs(dir: &Path, stop: &Path) {
    let mut current = Some(dir);
    while let Some(d) = current {
        if d == stop || !d.starts_with(stop) || fs::remove_dir(d).is_err() {
            break;
        }
        current = d.parent();
    }
}
