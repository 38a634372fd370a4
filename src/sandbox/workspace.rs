//! Per-paper workspace directories and exclusive run locks.
//!
//! Each paper-run owns its workspace exclusively for the run's
//! duration. The lock is a filesystem-level guarantee, not a
//! convention: no two concurrent runs for the same paper id can share a
//! workspace, and acquisition failure fails fast instead of corrupting
//! a live run's files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EnvironmentSetupError, ResourceUnavailableError};

/// Name of the lock file inside a paper workspace.
const LOCK_FILENAME: &str = ".run.lock";

/// Contents of a lock file, for diagnostics on contention.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    run_id: String,
    pid: u32,
    acquired_at: String,
}

/// Exclusive lock on a workspace directory, released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquires the lock for `run_id`, failing fast if another run
    /// holds it.
    pub fn acquire(workspace_dir: &Path, run_id: &str) -> Result<Self, EnvironmentSetupError> {
        let path = workspace_dir.join(LOCK_FILENAME);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<LockInfo>(&s).ok())
                    .map(|info| format!("run {} pid {}", info.run_id, info.pid))
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(ResourceUnavailableError::WorkspaceLocked {
                    path: workspace_dir.display().to_string(),
                    holder,
                }
                .into());
            }
            Err(err) => return Err(err.into()),
        };

        let info = LockInfo {
            run_id: run_id.to_string(),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        file.write_all(serde_json::to_string(&info)?.as_bytes())?;

        debug!("Acquired workspace lock at {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), err);
        }
    }
}

/// An exclusively-held workspace for one paper-run.
#[derive(Debug)]
pub struct Workspace {
    paper_id: String,
    root: PathBuf,
    _lock: WorkspaceLock,
}

impl Workspace {
    /// Creates (if needed) and locks `<base>/<paper_id>/`.
    pub fn acquire(
        base: &Path,
        paper_id: &str,
        run_id: &str,
    ) -> Result<Self, EnvironmentSetupError> {
        let root = base.join(paper_id);
        fs::create_dir_all(&root)?;
        let lock = WorkspaceLock::acquire(&root, run_id)?;
        fs::create_dir_all(root.join("data"))?;

        Ok(Self {
            paper_id: paper_id.to_string(),
            root,
            _lock: lock,
        })
    }

    /// Paper this workspace belongs to.
    pub fn paper_id(&self) -> &str {
        &self.paper_id
    }

    /// Workspace root on the host.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory datasets are materialized into.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Marker recording which dependency set is already installed.
    pub fn deps_manifest_path(&self) -> PathBuf {
        self.root.join(".deps_installed.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_creates_layout() {
        let base = TempDir::new().unwrap();
        let ws = Workspace::acquire(base.path(), "alpha", "run-1").unwrap();
        assert!(ws.root().exists());
        assert!(ws.data_dir().exists());
        assert!(ws.root().join(LOCK_FILENAME).exists());
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let base = TempDir::new().unwrap();
        let _held = Workspace::acquire(base.path(), "alpha", "run-1").unwrap();

        let err = Workspace::acquire(base.path(), "alpha", "run-2").unwrap_err();
        match err {
            EnvironmentSetupError::Resource(ResourceUnavailableError::WorkspaceLocked {
                holder,
                ..
            }) => assert!(holder.contains("run-1")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let base = TempDir::new().unwrap();
        {
            let _ws = Workspace::acquire(base.path(), "alpha", "run-1").unwrap();
        }
        // Lock file is gone; a new run can acquire.
        let ws = Workspace::acquire(base.path(), "alpha", "run-2").unwrap();
        assert_eq!(ws.paper_id(), "alpha");
    }

    #[test]
    fn test_different_papers_do_not_contend() {
        let base = TempDir::new().unwrap();
        let _a = Workspace::acquire(base.path(), "alpha", "run-1").unwrap();
        let _b = Workspace::acquire(base.path(), "beta", "run-1").unwrap();
    }
}
