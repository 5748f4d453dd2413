//! State directory layout.
//!
//! ```text
//! <state>/
//!   assembler.db
//!   logs/
//!   work/<build-id>/          (stage roots, venvs; removed after each build)
//! ```

use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".assembler";
pub const DB_FILE: &str = "assembler.db";

#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<project root>/.assembler`
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(STATE_DIR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn work_root(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn work_dir(&self, build_id: &str) -> PathBuf {
        self.work_root().join(build_id)
    }

    pub fn prepare(&self) -> AssemblerResult<()> {
        for dir in [self.root.clone(), self.logs_dir(), self.work_root()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AssemblerError::Storage(format!(
                    "Failed to create state directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// Staging location for an output directory: a hidden sibling, so the final
/// rename stays on one filesystem.
pub fn staging_path(output: &Path, build_id: &str) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output.with_file_name(format!(".{}.{}.partial", name, build_id))
}
