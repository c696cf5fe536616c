//! Run-scoped scratch directory with guaranteed cleanup.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Owns a scratch directory for the duration of a run.
///
/// The directory is removed when the guard drops, which covers early
/// returns, panics, and the run future being cancelled by a signal handler.
/// Callers that finish normally call [`ScratchGuard::cleanup`] to surface
/// removal errors instead of swallowing them in Drop.
#[derive(Debug)]
pub struct ScratchGuard {
    path: PathBuf,
    armed: bool,
}

impl ScratchGuard {
    /// Create (or re-create, empty) the scratch directory.
    pub fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("Failed to clean scratch dir {}", path.display()))?;
        }
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create scratch dir {}", path.display()))?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subdirectory for downloaded CSVs.
    pub fn downloads_dir(&self) -> PathBuf {
        self.path.join("downloads")
    }

    /// Subdirectory for transformed shards.
    pub fn shards_dir(&self) -> PathBuf {
        self.path.join("shards")
    }

    /// Remove the directory now and disarm the Drop handler.
    pub fn cleanup(mut self) -> Result<()> {
        self.armed = false;
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path)
                .with_context(|| format!("Failed to remove scratch dir {}", self.path.display()))?;
        }
        Ok(())
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), error = %e, "scratch cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("run");

        let guard = ScratchGuard::create(scratch.clone()).unwrap();
        std::fs::create_dir_all(guard.downloads_dir()).unwrap();
        std::fs::write(guard.downloads_dir().join("a.csv"), "x").unwrap();

        guard.cleanup().unwrap();
        assert!(!scratch.exists());
    }

    #[test]
    fn drop_removes_directory_on_early_exit() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("run");
        {
            let _guard = ScratchGuard::create(scratch.clone()).unwrap();
            std::fs::write(scratch.join("partial.ndjson"), "x").unwrap();
        }
        assert!(!scratch.exists());
    }

    #[test]
    fn create_empties_a_leftover_directory() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("run");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("stale.csv"), "old").unwrap();

        let guard = ScratchGuard::create(scratch.clone()).unwrap();
        assert!(!scratch.join("stale.csv").exists());
        guard.cleanup().unwrap();
    }
}
