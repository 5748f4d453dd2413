//! Stage root filesystems.
//!
//! Each build stage works in its own directory tree, the on-host stand-in for
//! the stage's isolation domain. System packages installed into a domain are
//! recorded in the domain's package registry; the registry of the final
//! domain ships in the image, which is what isolation checks and the startup
//! probe read.

use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Registry location inside a stage root (and inside the image).
pub const REGISTRY_PATH: &str = "var/lib/assembler/system-packages";

/// Set of system packages installed in one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemPackages(BTreeSet<String>);

impl SystemPackages {
    pub fn parse(content: &str) -> Self {
        Self(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    /// One package per line, sorted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for pkg in &self.0 {
            out.push_str(pkg);
            out.push('\n');
        }
        out
    }

    pub fn contains(&self, package: &str) -> bool {
        self.0.contains(package)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Packages from `required` that are not installed.
    pub fn missing<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        required
            .into_iter()
            .filter(|p| !self.0.contains(*p))
            .cloned()
            .collect()
    }

    /// Installed packages that also appear in `forbidden`.
    pub fn overlap(&self, forbidden: &BTreeSet<String>) -> Vec<String> {
        self.0.intersection(forbidden).cloned().collect()
    }

    fn extend(&mut self, packages: impl IntoIterator<Item = String>) {
        self.0.extend(packages);
    }
}

/// Map an absolute in-image path to a path relative to the image root.
pub fn image_relative(path: &Path) -> AssemblerResult<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(AssemblerError::Config(format!(
                    "image path must not escape the root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(out)
}

/// Directory tree standing in for one build stage's filesystem.
#[derive(Debug, Clone)]
pub struct StageRoot {
    name: String,
    base_image: String,
    path: PathBuf,
}

impl StageRoot {
    /// Create `<parent>/<name>` with an empty package registry.
    pub fn create(parent: &Path, name: &str, base_image: &str) -> AssemblerResult<Self> {
        let path = parent.join(name);
        let registry = path.join(REGISTRY_PATH);
        if let Some(dir) = registry.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                AssemblerError::Storage(format!(
                    "Failed to create stage root {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        if !registry.exists() {
            std::fs::write(&registry, "")?;
        }

        tracing::debug!(stage = name, base = base_image, root = %path.display(), "Created stage root");

        Ok(Self {
            name: name.to_string(),
            base_image: base_image.to_string(),
            path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host location of an absolute in-image path.
    pub fn resolve(&self, image_path: &Path) -> AssemblerResult<PathBuf> {
        Ok(self.path.join(image_relative(image_path)?))
    }

    pub fn system_packages(&self) -> AssemblerResult<SystemPackages> {
        let content = std::fs::read_to_string(self.path.join(REGISTRY_PATH))?;
        Ok(SystemPackages::parse(&content))
    }

    /// Record `packages` as installed in this domain.
    pub fn install_system_packages(
        &self,
        packages: &BTreeSet<String>,
    ) -> AssemblerResult<SystemPackages> {
        let mut installed = self.system_packages()?;
        installed.extend(packages.iter().cloned());
        std::fs::write(self.path.join(REGISTRY_PATH), installed.render())?;

        tracing::info!(
            stage = %self.name,
            packages = ?packages,
            "Installed system packages"
        );
        Ok(installed)
    }
}
