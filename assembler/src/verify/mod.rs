//! Post-build checks against a written image layout.
//!
//! - ownership: everything under the venv and working directory belongs to
//!   the image user
//! - isolation: no toolchain package recorded in the final registry
//! - startup: user resolution, runtime libraries, a write probe in the
//!   working directory

mod probe;
mod tree;

pub use probe::StartupProbe;
pub use tree::{ImageTree, Node, NodeKind};

use crate::image::{ANNOTATION_BUILD_MODE, ANNOTATION_TOOLCHAIN, OciImage};
use crate::installer::VenvLayout;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Ownership violations listed in full before being summarized.
const MAX_LISTED_VIOLATIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub manifest_digest: String,
    pub user: String,
    pub uid: u32,
    pub build_mode: Option<String>,
    pub layers: usize,
    pub entries: usize,
    /// Paths under the venv or working directory not owned by the user.
    pub foreign_owned: Vec<PathBuf>,
    /// Toolchain packages present in the final registry.
    pub leaked_toolchain: Vec<String>,
    pub runtime_libraries_checked: usize,
    /// Set when a native extension would fail to load at start.
    pub startup_error: Option<String>,
    /// Set when the user cannot create files in the working directory.
    pub write_error: Option<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.foreign_owned.is_empty()
            && self.leaked_toolchain.is_empty()
            && self.startup_error.is_none()
            && self.write_error.is_none()
    }

    /// Collapse the report into the first failing check's error.
    pub fn into_result(self) -> AssemblerResult<Self> {
        if !self.leaked_toolchain.is_empty() {
            return Err(AssemblerError::Isolation(self.leaked_toolchain.join(", ")));
        }
        if let Some(err) = &self.startup_error {
            return Err(AssemblerError::Image(err.clone()));
        }
        if !self.foreign_owned.is_empty() {
            let mut listed: Vec<String> = self
                .foreign_owned
                .iter()
                .take(MAX_LISTED_VIOLATIONS)
                .map(|p| p.display().to_string())
                .collect();
            if self.foreign_owned.len() > MAX_LISTED_VIOLATIONS {
                listed.push(format!(
                    "and {} more",
                    self.foreign_owned.len() - MAX_LISTED_VIOLATIONS
                ));
            }
            return Err(AssemblerError::PermissionDenied(format!(
                "not owned by {}: {}",
                self.user,
                listed.join(", ")
            )));
        }
        if let Some(err) = &self.write_error {
            return Err(AssemblerError::PermissionDenied(err.clone()));
        }
        Ok(self)
    }
}

/// Inspect the image at `image_dir`. `venv_path` and `python` locate the
/// virtual environment inside the image.
pub fn verify_image(image_dir: &Path, venv_path: &Path, python: &str) -> AssemblerResult<VerifyReport> {
    let image = OciImage::open(image_dir)?;
    let tree = ImageTree::from_image(&image)?;

    let user = image
        .user()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AssemblerError::Image("image config has no User".into()))?
        .to_string();
    let workdir = PathBuf::from(image.working_dir().unwrap_or("/"));
    let probe = StartupProbe::new(&tree, &user)?;
    let uid = probe.user().uid;

    let mut foreign_owned = Vec::new();
    for root in [venv_path, workdir.as_path()] {
        if let Some(node) = tree.get(root)
            && node.uid != uid
        {
            foreign_owned.push(root.to_path_buf());
        }
        for (path, node) in tree.entries_under(root) {
            if node.uid != uid && !foreign_owned.contains(path) {
                foreign_owned.push(path.clone());
            }
        }
    }

    let toolchain: BTreeSet<String> = image
        .annotation(ANNOTATION_TOOLCHAIN)
        .map(|t| {
            t.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let leaked_toolchain = tree.system_packages().overlap(&toolchain);

    let site_packages = VenvLayout::new(venv_path, python).site_packages();
    let (runtime_libraries_checked, startup_error) =
        match probe.check_runtime_libraries(&site_packages) {
            Ok(n) => (n, None),
            Err(e) => (0, Some(e.to_string())),
        };
    let write_error = probe
        .probe_write(&workdir.join(".write-probe"))
        .err()
        .map(|e| e.to_string());

    let report = VerifyReport {
        manifest_digest: image.manifest_digest().to_string(),
        user,
        uid,
        build_mode: image.annotation(ANNOTATION_BUILD_MODE).map(str::to_string),
        layers: image.layer_count(),
        entries: tree.len(),
        foreign_owned,
        leaked_toolchain,
        runtime_libraries_checked,
        startup_error,
        write_error,
    };

    if report.is_ok() {
        tracing::info!(image = %report.manifest_digest, entries = report.entries, "Image verified");
    } else {
        tracing::warn!(
            image = %report.manifest_digest,
            foreign_owned = report.foreign_owned.len(),
            leaked = report.leaked_toolchain.len(),
            startup_ok = report.startup_error.is_none(),
            writable = report.write_error.is_none(),
            "Image failed verification"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageSpec, LayerBuilder, OciLayoutWriter, Owner, REGISTRY_PATH};
    use std::collections::BTreeMap;

    fn write(dir: &Path, app_owner: Owner, registry: &str, toolchain: Option<&str>) {
        let mut b = LayerBuilder::new("all", 0);
        b.add_file_bytes(
            Path::new("/etc/passwd"),
            b"root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000::/home/app:/bin/bash\n".to_vec(),
            Owner::ROOT,
            0o644,
        )
        .unwrap();
        b.add_file_bytes(&Path::new("/").join(REGISTRY_PATH), registry.as_bytes().to_vec(), Owner::ROOT, 0o644)
            .unwrap();
        b.add_dir(Path::new("/app"), app_owner, 0o755).unwrap();
        b.add_dir(Path::new("/app/.venv"), app_owner, 0o755).unwrap();
        b.add_file_bytes(Path::new("/app/manage.py"), b"".to_vec(), app_owner, 0o644)
            .unwrap();

        let mut annotations = BTreeMap::new();
        if let Some(t) = toolchain {
            annotations.insert(ANNOTATION_TOOLCHAIN.to_string(), t.to_string());
        }
        let spec = ImageSpec {
            user: "app".into(),
            working_dir: "/app".into(),
            annotations,
            ..Default::default()
        };
        OciLayoutWriter::create(dir)
            .unwrap()
            .write_image(&spec, &[b.build().unwrap()])
            .unwrap();
    }

    #[test]
    fn test_clean_image_verifies() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), Owner::new(1000, 1000), "libpq5\n", Some("build-essential,libpq-dev"));
        let report = verify_image(dir.path(), Path::new("/app/.venv"), "3.12").unwrap();
        assert!(report.is_ok(), "{:?}", report);
        assert_eq!(report.uid, 1000);
        report.into_result().unwrap();
    }

    #[test]
    fn test_root_owned_app_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), Owner::ROOT, "", None);
        let report = verify_image(dir.path(), Path::new("/app/.venv"), "3.12").unwrap();
        assert!(report.foreign_owned.contains(&PathBuf::from("/app/manage.py")));
        assert!(report.write_error.is_some());
        assert!(matches!(
            report.into_result(),
            Err(AssemblerError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_leaked_toolchain_is_isolation_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), Owner::new(1000, 1000), "build-essential\nlibpq5\n", Some("build-essential"));
        let report = verify_image(dir.path(), Path::new("/app/.venv"), "3.12").unwrap();
        assert_eq!(report.leaked_toolchain, vec!["build-essential".to_string()]);
        assert!(matches!(report.into_result(), Err(AssemblerError::Isolation(_))));
    }
}
