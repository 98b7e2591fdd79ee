//! Crash-safe file replacement: write to a sibling temp file, fsync, rename
//! over the target, fsync the directory.

use crate::error::StoreError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Sibling temp path for `target` (`data.parquet` -> `data.parquet.tmp`).
pub fn tmp_path_for(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Removes a temporary file on drop unless disarmed.
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Call after a successful rename.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Atomically replace `target` with `contents`.
///
/// A reader racing with this call sees either the previous file or the new
/// one, never a prefix. On error the temp file is removed and the target is
/// left as it was.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(StoreError::io(parent))?;

    let tmp = tmp_path_for(target);
    let mut guard = TempFileGuard::new(tmp.clone());
    {
        let mut file = File::create(&tmp).map_err(StoreError::io(&tmp))?;
        file.write_all(contents).map_err(StoreError::io(&tmp))?;
        file.sync_all().map_err(StoreError::io(&tmp))?;
    }
    fs::rename(&tmp, target).map_err(StoreError::io(target))?;
    guard.disarm();

    sync_dir(parent)
}

/// Persist directory entries (renames, unlinks) in `dir`.
pub fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(StoreError::io(dir))
}

/// Remove `path` if present. Returns whether a file was removed.
pub fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_is_a_sibling() {
        assert_eq!(
            tmp_path_for(Path::new("/a/b/data.parquet")),
            PathBuf::from("/a/b/data.parquet.tmp")
        );
    }

    #[test]
    fn replaces_content_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/data.bin");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        assert!(!tmp_path_for(&target).exists());
    }

    #[test]
    fn failed_rename_leaves_target_and_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the target path makes the rename fail.
        let target = dir.path().join("data.bin");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"x").unwrap();

        assert!(write_atomic(&target, b"payload").is_err());
        assert!(target.join("keep").exists());
        assert!(!tmp_path_for(&target).exists());
    }

    #[test]
    fn remove_missing_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_if_exists(&dir.path().join("nope")).unwrap());
    }
}
