//! Destructive directory operations used as harness workload.
//!
//! Everything here tolerates the tree changing underneath it: another thread may delete or
//! recreate any part of it between two calls, or in the middle of one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Directory recreated by [`DirectoryMutator::recreate`].
pub const CHURN_SUBDIR: &str = "subdir";
/// File created inside [`CHURN_SUBDIR`].
pub const CHURN_FILE: &str = "test";

#[derive(Clone, Debug)]
pub struct DirectoryMutator {
    root: PathBuf,
}

impl DirectoryMutator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root (and parents) if missing.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Recursively delete the root. Never fails: entries that vanish concurrently are ignored and
    /// anything else is logged. Returns whether the root is gone afterwards.
    pub fn quiet_delete(&self) -> bool {
        quiet_delete(&self.root)
    }

    /// Delete the root and recreate it as `subdir/test`, an empty file one level down.
    pub fn recreate(&self) -> Result<PathBuf> {
        self.quiet_delete();
        let subdir = self.root.join(CHURN_SUBDIR);
        fs::create_dir_all(&subdir)?;
        let file = subdir.join(CHURN_FILE);
        fs::write(&file, b"")?;
        Ok(file)
    }

    /// Create (or truncate) a file directly under the root.
    pub fn create_file(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        fs::write(&path, b"")?;
        Ok(path)
    }

    /// Names of the root's direct entries, sorted. Entries that disappear while listing are
    /// skipped.
    pub fn list_entries(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            match entry {
                Ok(entry) => names.push(entry.file_name().to_string_lossy().into_owned()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Best-effort recursive delete of `path`.
pub fn quiet_delete(path: &Path) -> bool {
    remove_tree(path);
    let gone = fs::symlink_metadata(path).is_err();
    if !gone {
        debug!(target: "dirwatch::mutator", path = %path.display(), "tree survived quiet delete");
    }
    gone
}

fn remove_tree(path: &Path) {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return,
    };

    if !meta.is_dir() {
        log_failure(path, fs::remove_file(path));
        return;
    }

    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            remove_tree(&entry.path());
        }
    }
    log_failure(path, fs::remove_dir(path));
}

fn log_failure(path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            debug!(target: "dirwatch::mutator", path = %path.display(), error = %err, "delete failed");
        }
    }
}
