//! Local package index.
//!
//! ```text
//! <index>/
//!   django/
//!     5.0.6/
//!       requires.txt        (optional, one requirement per line)
//!       django/__init__.py  (copied into site-packages)
//!       bin/django-admin    (copied into the venv bin/)
//! ```

use crate::deps::{Requirement, Version, normalize_name};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::path::{Path, PathBuf};

/// Per-version metadata file listing direct requirements. Never installed.
pub const REQUIRES_FILE: &str = "requires.txt";

#[derive(Debug, Clone)]
pub struct PackageIndex {
    root: PathBuf,
}

impl PackageIndex {
    /// Open the index rooted at `root`.
    ///
    /// An index that does not exist or is not a directory is treated like an
    /// unreachable package source.
    pub fn open(root: &Path) -> AssemblerResult<Self> {
        if !root.is_dir() {
            return Err(AssemblerError::Resolution(format!(
                "package index unreachable at {}",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All published versions of `name`, ascending.
    pub fn versions(&self, name: &str) -> AssemblerResult<Vec<Version>> {
        let mut versions: Vec<Version> = self
            .version_dirs(name)?
            .into_iter()
            .map(|(version, _)| version)
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// Directory holding `name` at exactly `version`, if published.
    pub fn package_dir(&self, name: &str, version: &Version) -> AssemblerResult<Option<PathBuf>> {
        Ok(self
            .version_dirs(name)?
            .into_iter()
            .find(|(v, _)| v == version)
            .map(|(_, path)| path))
    }

    /// Direct requirements declared by `name` at `version`.
    pub fn requires(&self, name: &str, version: &Version) -> AssemblerResult<Vec<Requirement>> {
        let Some(dir) = self.package_dir(name, version)? else {
            return Ok(Vec::new());
        };
        let path = dir.join(REQUIRES_FILE);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        std::fs::read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(Requirement::parse)
            .collect()
    }

    fn version_dirs(&self, name: &str) -> AssemblerResult<Vec<(Version, PathBuf)>> {
        let dir = self.root.join(normalize_name(name));
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(raw) = file_name.to_str() else {
                continue;
            };
            match Version::parse(raw) {
                Ok(version) => out.push((version, entry.path())),
                Err(_) => {
                    tracing::debug!(
                        package = name,
                        entry = raw,
                        "Ignoring index entry with unparseable version"
                    );
                }
            }
        }
        Ok(out)
    }
}
