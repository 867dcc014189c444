//! Temporary network isolation for a task's compose environment.
//!
//! Docker Compose merges `docker-compose.override.yaml` into the task's
//! compose file, so writing an override that marks the default network
//! `internal` cuts the task off from the outside world for the duration of
//! a validation.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub const OVERRIDE_FILENAME: &str = "docker-compose.override.yaml";

const OVERRIDE_CONTENT: &str = "\
# Auto-generated override for network isolation testing
# This file is temporary and should be removed after validation
networks:
  default:
    internal: true
";

/// Holds the override file in place; removes it on drop.
///
/// An override that already existed is never touched.
#[derive(Debug)]
pub struct NetworkIsolation {
    path: PathBuf,
    owned: bool,
}

impl NetworkIsolation {
    /// Write the override into `task_dir` unless one already exists.
    pub fn enable(task_dir: &Path) -> std::io::Result<Self> {
        let path = task_dir.join(OVERRIDE_FILENAME);
        if path.exists() {
            debug!(path = %path.display(), "Compose override already present, leaving it alone");
            return Ok(Self { path, owned: false });
        }
        fs::write(&path, OVERRIDE_CONTENT)?;
        debug!(path = %path.display(), "Enabled network isolation");
        Ok(Self { path, owned: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this guard wrote the override and will remove it.
    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl Drop for NetworkIsolation {
    fn drop(&mut self) {
        if !self.owned || !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove network isolation override");
        }
    }
}
