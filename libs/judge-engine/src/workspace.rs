/// Workspace Manager - Per-Job Filesystem Scopes
///
/// **Responsibility:**
/// Allocate one private directory per job attempt and guarantee it is removed.
///
/// **Guarantees:**
/// - Directory names come from a sanitized job id plus a fresh UUID, so
///   caller-supplied ids never reach the filesystem verbatim and colliding
///   ids still get distinct directories
/// - `release()` on the normal path, `Drop` on every other path (early
///   return, panic, cancelled future)
/// - `sweep_orphans()` at startup removes directories left by a crashed run
use crate::error::JudgeError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Every workspace directory starts with this prefix; the sweep only touches these
const WORKSPACE_PREFIX: &str = "ws-";
const MAX_ID_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkspaceStats {
    pub created: u64,
    pub released: u64,
    pub live: u64,
}

#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    created: AtomicU64,
    released: AtomicU64,
}

impl WorkspaceManager {
    /// Create a manager rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Arc<Self>, JudgeError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            JudgeError::Workspace(format!(
                "Failed to create workspace root {}: {}",
                root.display(),
                e
            ))
        })?;

        Ok(Arc::new(Self {
            root,
            created: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh, empty directory for one job attempt
    pub async fn acquire(self: &Arc<Self>, job_id: &str) -> Result<Workspace, JudgeError> {
        let name = format!(
            "{}{}-{}",
            WORKSPACE_PREFIX,
            sanitize_job_id(job_id),
            Uuid::new_v4().simple()
        );
        let dir = self.root.join(name);

        // create_dir (not create_dir_all) fails if the path somehow exists
        tokio::fs::create_dir(&dir).await.map_err(|e| {
            JudgeError::Workspace(format!(
                "Failed to create workspace {}: {}",
                dir.display(),
                e
            ))
        })?;

        self.created.fetch_add(1, Ordering::SeqCst);
        debug!(job_id = %job_id, workspace = %dir.display(), "Workspace acquired");

        Ok(Workspace {
            dir,
            manager: Arc::clone(self),
            released: false,
        })
    }

    /// Remove workspace directories left behind by a previous process
    pub async fn sweep_orphans(&self) -> Result<usize, JudgeError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            JudgeError::Workspace(format!(
                "Failed to read workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }

            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned workspace"),
            }
        }

        if removed > 0 {
            info!(removed = removed, root = %self.root.display(), "Swept orphaned workspaces");
        }
        Ok(removed)
    }

    pub fn stats(&self) -> WorkspaceStats {
        let created = self.created.load(Ordering::SeqCst);
        let released = self.released.load(Ordering::SeqCst);
        WorkspaceStats {
            created,
            released,
            live: created.saturating_sub(released),
        }
    }

    fn mark_released(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// An exclusively-owned job directory. Removed on `release()` or drop.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    manager: Arc<WorkspaceManager>,
    released: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Write `content` to a plain file name inside the workspace
    pub async fn write(&self, filename: &str, content: &[u8]) -> Result<PathBuf, JudgeError> {
        if !is_plain_file_name(filename) {
            return Err(JudgeError::Workspace(format!(
                "Refusing to write outside workspace: {:?}",
                filename
            )));
        }

        let path = self.dir.join(filename);
        tokio::fs::write(&path, content).await.map_err(|e| {
            JudgeError::Workspace(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Remove the directory. Counted once whether it succeeds or not.
    pub async fn release(mut self) -> Result<(), JudgeError> {
        self.released = true;
        self.manager.mark_released();

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(workspace = %self.dir.display(), "Workspace released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JudgeError::Workspace(format!(
                "Failed to remove workspace {}: {}",
                self.dir.display(),
                e
            ))),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.manager.mark_released();

        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(workspace = %self.dir.display(), error = %e, "Failed to clean up workspace on drop");
            }
        }
    }
}

/// Reduce a caller-supplied id to `[A-Za-z0-9_-]`, at most 32 chars
pub fn sanitize_job_id(job_id: &str) -> String {
    let cleaned: String = job_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_ID_CHARS)
        .collect();

    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}
