//! Virtual environment artifact layout.
//!
//! The venv is a self-contained tree with its own `site-packages`; the
//! interpreter's global site directory is never written to.

use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Shared libraries a native extension links against, one per line.
pub const RUNTIME_LIBS_FILE: &str = "RUNTIME_LIBS";
pub const INSTALLER_TAG: &str = "image-assembler";

/// A distribution found in the venv's `site-packages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledDist {
    pub name: String,
    pub version: String,
    pub runtime_libs: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VenvLayout {
    root: PathBuf,
    python: String,
}

impl VenvLayout {
    /// `python` is the `X.Y` interpreter version.
    pub fn new(root: impl Into<PathBuf>, python: &str) -> Self {
        Self {
            root: root.into(),
            python: python.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn site_packages(&self) -> PathBuf {
        self.root
            .join("lib")
            .join(format!("python{}", self.python))
            .join("site-packages")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("pyvenv.cfg")
    }

    pub fn is_created(&self) -> bool {
        self.config_path().is_file()
    }

    /// Create the directory skeleton, `pyvenv.cfg` and interpreter links.
    pub fn create(&self) -> AssemblerResult<()> {
        std::fs::create_dir_all(self.site_packages()).map_err(|e| {
            AssemblerError::Install(format!(
                "Failed to create venv at {}: {}",
                self.root.display(),
                e
            ))
        })?;
        std::fs::create_dir_all(self.bin_dir())?;

        let cfg = format!(
            "home = /usr/local/bin\ninclude-system-site-packages = false\nversion = {}\n",
            self.python
        );
        std::fs::write(self.config_path(), cfg)?;

        let interpreter = format!("/usr/local/bin/python{}", self.python);
        for link in ["python", "python3", &format!("python{}", self.python)] {
            let path = self.bin_dir().join(link);
            if path.symlink_metadata().is_err() {
                std::os::unix::fs::symlink(&interpreter, &path)?;
            }
        }

        tracing::debug!(venv = %self.root.display(), python = %self.python, "Created virtual environment");
        Ok(())
    }

    fn dist_info_dir(&self, name: &str, version: &str) -> PathBuf {
        self.site_packages()
            .join(format!("{}-{}.dist-info", name.replace('-', "_"), version))
    }

    /// Record an installed distribution.
    pub fn write_dist_info(
        &self,
        name: &str,
        version: &str,
        runtime_libs: &[String],
    ) -> AssemblerResult<()> {
        let dir = self.dist_info_dir(name, version);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("METADATA"),
            format!("Metadata-Version: 2.1\nName: {}\nVersion: {}\n", name, version),
        )?;
        std::fs::write(dir.join("INSTALLER"), format!("{}\n", INSTALLER_TAG))?;
        if !runtime_libs.is_empty() {
            let mut libs = runtime_libs.join("\n");
            libs.push('\n');
            std::fs::write(dir.join(RUNTIME_LIBS_FILE), libs)?;
        }
        Ok(())
    }

    /// Distributions recorded in `site-packages`, keyed by normalized name.
    pub fn installed_packages(&self) -> AssemblerResult<BTreeMap<String, InstalledDist>> {
        installed_in(&self.site_packages())
    }

    /// `name -> version` of everything installed.
    pub fn pins(&self) -> AssemblerResult<BTreeMap<String, String>> {
        Ok(self
            .installed_packages()?
            .into_iter()
            .map(|(name, dist)| (name, dist.version))
            .collect())
    }
}

/// Scan a `site-packages` directory for `*.dist-info` records.
pub fn installed_in(site_packages: &Path) -> AssemblerResult<BTreeMap<String, InstalledDist>> {
    let mut out = BTreeMap::new();
    if !site_packages.is_dir() {
        return Ok(out);
    }

    for entry in std::fs::read_dir(site_packages)? {
        let entry = entry?;
        let path = entry.path();
        let is_dist_info = path
            .extension()
            .is_some_and(|ext| ext == "dist-info");
        if !is_dist_info || !path.is_dir() {
            continue;
        }

        let metadata = match std::fs::read_to_string(path.join("METADATA")) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "dist-info without METADATA");
                continue;
            }
        };
        let Some(dist) = parse_metadata(&metadata, &path)? else {
            continue;
        };
        out.insert(crate::deps::normalize_name(&dist.name), dist);
    }
    Ok(out)
}

fn parse_metadata(metadata: &str, dir: &Path) -> AssemblerResult<Option<InstalledDist>> {
    let header = |key: &str| {
        metadata
            .lines()
            .find_map(|l| l.strip_prefix(key).map(|v| v.trim().to_string()))
    };
    let (Some(name), Some(version)) = (header("Name:"), header("Version:")) else {
        tracing::warn!(path = %dir.display(), "dist-info METADATA lacks Name or Version");
        return Ok(None);
    };

    let libs_path = dir.join(RUNTIME_LIBS_FILE);
    let runtime_libs = if libs_path.is_file() {
        std::fs::read_to_string(&libs_path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    Ok(Some(InstalledDist {
        name,
        version,
        runtime_libs,
    }))
}
