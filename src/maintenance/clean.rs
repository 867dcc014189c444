//! Removal plan for local artifacts.
//!
//! Job outputs and logs are always candidates; ledgers, the converter cache
//! and task outputs only on request. Only paths that exist end up in the
//! plan, so a dry run shows exactly what would go.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::farm::references::REFERENCE_LEDGER_FILE;

/// What to include beyond the default job and log directories.
#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    pub ledgers: bool,
    pub cache: bool,
    pub tasks: bool,
    /// Old `jobs/` and `runs/` directories in the working directory.
    pub leftovers: bool,
}

impl CleanOptions {
    /// Everything.
    pub fn all() -> Self {
        Self {
            ledgers: true,
            cache: true,
            tasks: true,
            leftovers: true,
        }
    }
}

/// Paths a `clean` would remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanPlan {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Counts of what a `clean` removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub removed_dirs: usize,
    pub removed_files: usize,
}

impl CleanPlan {
    pub fn build(state_dir: &Path, output_root: &Path, options: &CleanOptions) -> Self {
        let mut dirs = vec![state_dir.join("harbor-jobs"), state_dir.join("logs")];
        let mut files = Vec::new();

        if options.ledgers {
            files.push(state_dir.join(REFERENCE_LEDGER_FILE));
            files.push(state_dir.join("create.jsonl"));
            dirs.push(state_dir.join("farm"));
        }
        if options.cache {
            dirs.push(state_dir.join("cache"));
        }
        if options.tasks {
            dirs.push(output_root.to_path_buf());
        }
        if options.leftovers {
            dirs.push(PathBuf::from("jobs"));
            dirs.push(PathBuf::from("runs"));
        }

        Self {
            dirs: dirs.into_iter().filter(|d| d.is_dir()).collect(),
            files: files.into_iter().filter(|f| f.is_file()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.files.is_empty()
    }

    /// Remove every planned path. Failures are logged and not counted.
    pub fn execute(&self) -> CleanReport {
        let mut report = CleanReport::default();
        for dir in &self.dirs {
            match fs::remove_dir_all(dir) {
                Ok(()) => report.removed_dirs += 1,
                Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove directory"),
            }
        }
        for file in &self.files {
            match fs::remove_file(file) {
                Ok(()) => report.removed_files += 1,
                Err(e) => warn!(path = %file.display(), error = %e, "Failed to remove file"),
            }
        }
        report
    }
}
