//! Per-run scratch directory.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::Result;
use crate::harness::report::RunCounters;
use crate::mutator::quiet_delete;

/// Temporary directory a run works under, removed quietly when the run ends.
#[derive(Debug)]
pub struct ScratchDir {
    temp: TempDir,
    watched: PathBuf,
}

impl ScratchDir {
    /// Create a fresh scratch directory under `base`, or under the system temp dir.
    pub fn create(base: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("dirwatch-");
        let temp = match base {
            Some(base) => {
                fs::create_dir_all(base)?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        let watched = temp.path().join("watched");
        debug!(target: "dirwatch::harness", path = %watched.display(), "scratch directory created");
        Ok(Self { temp, watched })
    }

    /// Directory the run watches and churns.
    pub fn watched(&self) -> &Path {
        &self.watched
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Remove everything. Failures are logged and counted, never returned.
    pub fn cleanup(self, counters: &RunCounters) {
        let root = self.temp.path().to_path_buf();
        if !quiet_delete(&self.watched) {
            counters.record_cleanup_failure();
        }
        match self.temp.close() {
            Ok(()) => debug!(target: "dirwatch::harness", path = %root.display(), "scratch directory removed"),
            Err(err) => {
                counters.record_cleanup_failure();
                warn!(target: "dirwatch::harness", path = %root.display(), error = %err, "scratch cleanup failed");
            }
        }
    }
}
