//! Installer backed by a local package index directory.

use super::index::{PackageIndex, REQUIRES_FILE};
use super::venv::VenvLayout;
use super::{InstallReport, InstallRequest, PackageInstaller};
use crate::deps::{NativeTable, ResolvedPackage};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use filetime::FileTime;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::WalkDir;

/// Copies each resolved distribution out of the index into the venv.
pub struct IndexInstaller {
    index: PackageIndex,
    native: NativeTable,
    /// mtime stamped on every installed regular file
    mtime: i64,
}

impl IndexInstaller {
    pub fn new(index: PackageIndex, native: NativeTable) -> Self {
        Self {
            index,
            native,
            mtime: 0,
        }
    }

    pub fn with_mtime(mut self, epoch: u64) -> Self {
        self.mtime = epoch as i64;
        self
    }
}

#[async_trait]
impl PackageInstaller for IndexInstaller {
    fn name(&self) -> &str {
        "index"
    }

    async fn install(&self, request: InstallRequest) -> AssemblerResult<InstallReport> {
        let index = self.index.clone();
        let native = self.native.clone();
        let mtime = self.mtime;

        let venv = request.venv.clone();
        let packages = request.packages.clone();
        let installed = tokio::task::spawn_blocking(move || {
            install_all(&index, &native, &venv, &packages, mtime)
        })
        .await
        .map_err(|e| AssemblerError::Internal(format!("install task failed: {}", e)))??;

        if !request.frozen {
            tracing::warn!(
                venv = %request.venv.root().display(),
                "Installed set was resolved without a lockfile and is not reproducible"
            );
        }

        Ok(InstallReport {
            installer: self.name().to_string(),
            packages: installed,
            reproducible: request.frozen,
        })
    }
}

fn install_all(
    index: &PackageIndex,
    native: &NativeTable,
    venv: &VenvLayout,
    packages: &[ResolvedPackage],
    mtime: i64,
) -> AssemblerResult<BTreeMap<String, String>> {
    venv.create()?;

    let mut installed = BTreeMap::new();
    for pkg in packages {
        let source = index.package_dir(&pkg.name, &pkg.version)?.ok_or_else(|| {
            AssemblerError::Resolution(format!(
                "{}=={} is not available in {}",
                pkg.name,
                pkg.version,
                index.root().display()
            ))
        })?;

        install_one(&source, venv, mtime)?;

        let runtime_libs = native
            .get(&pkg.name)
            .map(|n| n.runtime.clone())
            .unwrap_or_default();
        venv.write_dist_info(&pkg.name, &pkg.version.to_string(), &runtime_libs)?;

        tracing::debug!(
            package = %pkg.name,
            version = %pkg.version,
            native = pkg.native,
            "Installed package"
        );
        installed.insert(pkg.name.clone(), pkg.version.to_string());
    }

    tracing::info!(
        venv = %venv.root().display(),
        packages = installed.len(),
        "Populated virtual environment"
    );
    Ok(installed)
}

/// Top-level `bin/` lands in the venv `bin/`, everything else in
/// `site-packages`.
fn install_one(source: &Path, venv: &VenvLayout, mtime: i64) -> AssemblerResult<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == REQUIRES_FILE {
            continue;
        }
        if name == "bin" && entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &venv.bin_dir(), mtime)?;
        } else {
            copy_tree(&entry.path(), &venv.site_packages().join(&name), mtime)?;
        }
    }
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path, mtime: i64) -> AssemblerResult<()> {
    let stamp = FileTime::from_unix_time(mtime, 0);
    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            AssemblerError::Install(format!("failed to read {}: {}", src.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| AssemblerError::Internal(e.to_string()))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                std::fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| {
                AssemblerError::Install(format!(
                    "failed to copy {} into venv: {}",
                    entry.path().display(),
                    e
                ))
            })?;
            filetime::set_file_mtime(&target, stamp)?;
        }
    }
    Ok(())
}
