//! Dependency installation into a virtual environment artifact.
//!
//! The installer is a seam: the resolution algorithm of a real package
//! manager is an external collaborator. `IndexInstaller` materializes a
//! resolved package set from a local index; `CommandInstaller` hands the job
//! to an external tool.

mod command;
mod index;
mod local;
mod venv;

pub use command::CommandInstaller;
pub use index::{PackageIndex, REQUIRES_FILE};
pub use local::IndexInstaller;
pub use venv::{INSTALLER_TAG, InstalledDist, RUNTIME_LIBS_FILE, VenvLayout, installed_in};

use crate::deps::{NativeTable, Resolution, ResolvedPackage, package_set_digest};
use crate::image::SystemPackages;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Input for one install run.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Build root holding the manifest and lockfile.
    pub project_root: PathBuf,
    pub packages: Vec<ResolvedPackage>,
    /// Packages come from a lockfile.
    pub frozen: bool,
    /// Include the dev group (test stage only).
    pub include_dev: bool,
    pub venv: VenvLayout,
}

impl InstallRequest {
    pub fn new(project_root: PathBuf, resolution: &Resolution, venv: VenvLayout) -> Self {
        Self {
            project_root,
            packages: resolution.packages.clone(),
            frozen: resolution.frozen,
            include_dev: false,
            venv,
        }
    }

    pub fn with_dev(mut self, include_dev: bool) -> Self {
        self.include_dev = include_dev;
        self
    }
}

/// What ended up in the venv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub installer: String,
    /// `name -> version`
    pub packages: BTreeMap<String, String>,
    /// False when no lockfile pinned the set.
    pub reproducible: bool,
}

impl InstallReport {
    pub fn digest(&self) -> String {
        package_set_digest(&self.packages)
    }
}

#[async_trait]
pub trait PackageInstaller: Send + Sync {
    fn name(&self) -> &str;

    /// Install `request.packages` into `request.venv`.
    async fn install(&self, request: InstallRequest) -> AssemblerResult<InstallReport>;
}

/// Differences between the pinned and the installed package sets, one
/// `name: pinned -> installed` line per package.
pub fn pin_drift(
    pinned: &BTreeMap<String, String>,
    installed: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut drift = Vec::new();
    for (name, version) in pinned {
        match installed.get(name) {
            Some(got) if got == version => {}
            Some(got) => drift.push(format!("{name}: {version} -> {got}")),
            None => drift.push(format!("{name}: {version} -> missing")),
        }
    }
    for (name, got) in installed {
        if !pinned.contains_key(name) {
            drift.push(format!("{name}: unpinned -> {got}"));
        }
    }
    drift
}

/// Check that the builder domain can compile every native package.
///
/// Each native package needs the toolchain plus its own build packages in
/// the builder's system package registry.
pub fn ensure_native_toolchain(
    builder: &SystemPackages,
    packages: &[ResolvedPackage],
    native: &NativeTable,
    toolchain: &BTreeSet<String>,
) -> AssemblerResult<()> {
    for pkg in packages.iter().filter(|p| p.native) {
        if toolchain.is_empty() {
            return Err(AssemblerError::NativeBuild {
                package: pkg.name.clone(),
                reason: "no compiler toolchain configured for the install domain".into(),
            });
        }
        let mut required: Vec<String> = toolchain.iter().cloned().collect();
        if let Some(entry) = native.get(&pkg.name) {
            required.extend(entry.build.iter().cloned());
        }
        let missing = builder.missing(&required);
        if !missing.is_empty() {
            return Err(AssemblerError::NativeBuild {
                package: pkg.name.clone(),
                reason: format!("builder domain lacks {}", missing.join(", ")),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::Version;

    fn pkg(name: &str, native: bool) -> ResolvedPackage {
        ResolvedPackage {
            name: name.into(),
            version: Version::parse("1.0").unwrap(),
            native,
        }
    }

    #[test]
    fn test_pin_drift_lists_changed_missing_and_extra() {
        let pinned: BTreeMap<String, String> = [
            ("django".to_string(), "5.0.6".to_string()),
            ("asgiref".to_string(), "3.8.1".to_string()),
        ]
        .into();
        let installed: BTreeMap<String, String> = [
            ("django".to_string(), "9.9.9".to_string()),
            ("six".to_string(), "1.16.0".to_string()),
        ]
        .into();

        assert!(pin_drift(&pinned, &pinned).is_empty());
        assert_eq!(
            pin_drift(&pinned, &installed),
            vec![
                "asgiref: 3.8.1 -> missing",
                "django: 5.0.6 -> 9.9.9",
                "six: unpinned -> 1.16.0",
            ]
        );
    }

    #[test]
    fn test_native_toolchain_missing_headers() {
        let toolchain: BTreeSet<String> = ["build-essential".to_string()].into();
        let builder = SystemPackages::parse("build-essential\n");
        let err = ensure_native_toolchain(
            &builder,
            &[pkg("django", false), pkg("psycopg2", true)],
            &NativeTable::builtin(),
            &toolchain,
        )
        .unwrap_err();
        match err {
            AssemblerError::NativeBuild { package, reason } => {
                assert_eq!(package, "psycopg2");
                assert!(reason.contains("libpq-dev"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_native_package_needs_a_toolchain() {
        let builder = SystemPackages::parse("libpq-dev\n");
        let err = ensure_native_toolchain(
            &builder,
            &[pkg("psycopg2", true)],
            &NativeTable::builtin(),
            &BTreeSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, AssemblerError::NativeBuild { ref package, .. } if package == "psycopg2"));

        // Pure packages build without one
        ensure_native_toolchain(&builder, &[pkg("django", false)], &NativeTable::builtin(), &BTreeSet::new())
            .unwrap();
    }

    #[test]
    fn test_native_toolchain_satisfied() {
        let toolchain: BTreeSet<String> = ["build-essential".to_string()].into();
        let builder = SystemPackages::parse("build-essential\nlibpq-dev\n");
        ensure_native_toolchain(
            &builder,
            &[pkg("psycopg2", true)],
            &NativeTable::builtin(),
            &toolchain,
        )
        .unwrap();
    }
}
