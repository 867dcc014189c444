//! Scoped ownership of a task's output directories.
//!
//! An [`ArtifactGuard`] is taken before a conversion starts. Unless the
//! attempt calls [`ArtifactGuard::commit`], dropping the guard removes every
//! directory the attempt may have half-written, on every exit path
//! (early return, `?`, timeout cancellation, or panic unwinding).

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

/// Directory for tasks moved aside by the converter.
pub const TRASH_DIR: &str = "trash";

#[derive(Debug)]
struct GuardedPath {
    path: PathBuf,
    existed_before: bool,
}

/// Removes a task's directories on drop unless committed.
#[derive(Debug)]
pub struct ArtifactGuard {
    task_id: String,
    paths: Vec<GuardedPath>,
    remove_existing: bool,
    committed: bool,
}

impl ArtifactGuard {
    /// Guard `<tasks_root>/<task_id>` and `trash/<task_id>`.
    ///
    /// Directories that already existed when the guard was taken are left in
    /// place on failure unless `remove_existing` is set (a forced regeneration
    /// overwrites them, so whatever is left is partial).
    pub fn acquire(tasks_root: &Path, task_id: &str, remove_existing: bool) -> Self {
        let paths = [tasks_root.join(task_id), Path::new(TRASH_DIR).join(task_id)]
            .into_iter()
            .map(|path| GuardedPath {
                existed_before: path.exists(),
                path,
            })
            .collect();
        Self {
            task_id: task_id.to_string(),
            paths,
            remove_existing,
            committed: false,
        }
    }

    /// The primary task directory.
    pub fn task_dir(&self) -> &Path {
        &self.paths[0].path
    }

    /// Keep the directories: the attempt succeeded.
    pub fn commit(mut self) {
        self.committed = true;
    }

    fn cleanup(&self) {
        let mut removed_any = false;
        for guarded in &self.paths {
            if guarded.existed_before && !self.remove_existing {
                continue;
            }
            if !guarded.path.exists() {
                continue;
            }
            match std::fs::remove_dir_all(&guarded.path) {
                Ok(()) => removed_any = true,
                Err(e) => {
                    warn!(task_id = %self.task_id, path = %guarded.path.display(), error = %e, "Failed to remove incomplete task directory")
                }
            }
        }
        if removed_any {
            info!(task_id = %self.task_id, "Cleaned up incomplete task directory");
        } else {
            debug!(task_id = %self.task_id, "Nothing to clean up");
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if !self.committed {
            self.cleanup();
        }
    }
}
