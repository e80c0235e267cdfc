//! Per-job scratch directory.
//!
//! A [`JobWorkspace`] holds the downloaded input and the transcoder output
//! for one execution. It is removed when dropped, so every exit path of the
//! executor (success, failure, cancellation, panic) cleans it up; startup
//! sweeps whatever a crashed process left behind.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use transforge_common::{Error, JobId, Result};

/// Name prefix of every workspace directory.
pub const WORKSPACE_PREFIX: &str = "transforge-job-";

pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    /// Create a fresh workspace under `parent`, creating `parent` if needed.
    ///
    /// The directory calls run on the blocking pool.
    pub async fn create(parent: &Path, job_id: JobId) -> Result<Self> {
        let parent = parent.to_path_buf();
        let prefix = format!("{WORKSPACE_PREFIX}{job_id}-");
        let dir = tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&parent)?;
            tempfile::Builder::new().prefix(&prefix).tempdir_in(&parent)
        })
        .await
        .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| Error::internal(format!("failed to create workspace: {e}")))?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a named file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the workspace on the blocking pool, off the async threads.
    pub async fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        let result = tokio::task::spawn_blocking(move || self.dir.close()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(path = %path.display(), "Failed to remove workspace: {e}"),
            Err(e) => tracing::warn!(path = %path.display(), "Workspace cleanup task failed: {e}"),
        }
    }
}

/// Remove leftover workspaces under `parent`. Returns how many were removed.
pub fn sweep_stale(parent: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(parent) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let is_workspace = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(WORKSPACE_PREFIX));
        let is_dir = entry.file_type().is_ok_and(|t| t.is_dir());
        if is_workspace && is_dir {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %entry.path().display(), "Failed to remove stale workspace: {e}"),
            }
        }
    }
    removed
}
