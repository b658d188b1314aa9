use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};

const WORKSPACE_PREFIX: &str = "vidscribe-";

/// Scratch directory owned by exactly one job attempt. Everything inside is
/// removed when the workspace is closed or dropped, whichever path the
/// attempt took.
#[derive(Debug)]
pub struct AttemptWorkspace {
    dir: TempDir,
    job_id: String,
    attempt: u32,
}

impl AttemptWorkspace {
    pub fn create(root: &Path, job_id: &str, attempt: u32) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            PipelineError::Storage(format!("failed to create {}: {}", root.display(), e))
        })?;

        let dir = tempfile::Builder::new()
            .prefix(&format!("{}{}-a{}-", WORKSPACE_PREFIX, job_id, attempt))
            .tempdir_in(root)
            .map_err(|e| PipelineError::Storage(format!("failed to create workspace: {}", e)))?;

        debug!("📂 Workspace for job {} attempt {}: {}", job_id, attempt, dir.path().display());
        Ok(Self {
            dir,
            job_id: job_id.to_string(),
            attempt,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path for a file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the workspace now, reporting failures
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| {
            PipelineError::Storage(format!("failed to remove workspace {}: {}", path.display(), e))
        })?;
        debug!("🧹 Removed workspace for job {} attempt {}", self.job_id, self.attempt);
        Ok(())
    }
}

/// Remove workspaces older than `max_age` left behind by a killed process.
/// Returns how many were removed.
pub fn sweep_orphaned_workspaces(root: &Path, max_age: Duration) -> usize {
    if !root.exists() {
        return 0;
    }

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let is_workspace = entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.starts_with(WORKSPACE_PREFIX));
        if !is_workspace {
            continue;
        }

        let age = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove orphaned workspace {}: {}", entry.path().display(), e),
        }
    }

    if removed > 0 {
        info!("🧹 Removed {} orphaned workspaces from {}", removed, root.display());
    }
    removed
}
