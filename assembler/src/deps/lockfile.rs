//! Lockfile (`uv.lock` layout).
//!
//! Only the fields needed for a frozen install are read: each `[[package]]`
//! entry's name, version and dependency edges. The project's own entry
//! (editable or virtual source) is skipped.

use super::version::{Version, normalize_name};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RawLock {
    #[serde(default, rename = "package")]
    packages: Vec<RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    name: String,
    version: Option<String>,
    source: Option<toml::Table>,
    #[serde(default)]
    dependencies: Vec<RawDependency>,
}

#[derive(Debug, Deserialize)]
struct RawDependency {
    name: String,
}

#[derive(Debug, Clone)]
pub struct LockedPackage {
    /// Normalized name
    pub name: String,
    pub version: Version,
    /// Normalized names of direct dependencies
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Lockfile {
    packages: BTreeMap<String, LockedPackage>,
    digest: String,
}

impl Lockfile {
    pub fn load(path: &Path) -> AssemblerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AssemblerError::Manifest(format!("failed to read lockfile {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| AssemblerError::Manifest(format!("{}: {}", path.display(), e)))
    }

    /// Load the lockfile if it exists. A missing lockfile is not an error:
    /// installation falls back to full resolution.
    pub fn load_optional(path: &Path) -> AssemblerResult<Option<Self>> {
        if path.is_file() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn parse(content: &str) -> AssemblerResult<Self> {
        let raw: RawLock = toml::from_str(content)
            .map_err(|e| AssemblerError::Manifest(format!("invalid lockfile: {}", e)))?;

        let mut packages = BTreeMap::new();
        for pkg in raw.packages {
            if pkg.source.as_ref().is_some_and(|source| {
                source.contains_key("editable") || source.contains_key("virtual")
            }) {
                continue;
            }

            let name = normalize_name(&pkg.name);
            let version = pkg.version.as_deref().ok_or_else(|| {
                AssemblerError::Manifest(format!("locked package '{}' has no version", name))
            })?;
            let locked = LockedPackage {
                name: name.clone(),
                version: Version::parse(version)?,
                dependencies: pkg
                    .dependencies
                    .iter()
                    .map(|d| normalize_name(&d.name))
                    .collect(),
            };

            if let Some(existing) = packages.insert(name.clone(), locked)
                && existing.version.to_string() != version
            {
                return Err(AssemblerError::Manifest(format!(
                    "package '{}' is locked at more than one version ({} and {})",
                    name, existing.version, version
                )));
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());

        Ok(Self {
            packages,
            digest: hex::encode(hasher.finalize()),
        })
    }

    pub fn get(&self, name: &str) -> Option<&LockedPackage> {
        self.packages.get(&normalize_name(name))
    }

    pub fn packages(&self) -> impl Iterator<Item = &LockedPackage> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// SHA-256 of the lockfile bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Dependency closure of `roots`, sorted by name.
    ///
    /// Every package reachable from a root must itself be locked; a dangling
    /// edge means the lockfile is inconsistent.
    pub fn closure(&self, roots: &[String]) -> AssemblerResult<Vec<&LockedPackage>> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<(String, Option<String>)> =
            roots.iter().map(|r| (normalize_name(r), None)).collect();

        while let Some((name, parent)) = queue.pop_front() {
            if seen.contains(&name) {
                continue;
            }
            let pkg = self.packages.get(&name).ok_or_else(|| {
                AssemblerError::Resolution(match &parent {
                    Some(parent) => format!(
                        "lockfile is inconsistent: '{}' depends on '{}' which is not locked",
                        parent, name
                    ),
                    None => format!("'{}' is not in the lockfile", name),
                })
            })?;
            for dep in &pkg.dependencies {
                queue.push_back((dep.clone(), Some(name.clone())));
            }
            seen.insert(name);
        }

        Ok(seen
            .iter()
            .filter_map(|name| self.packages.get(name))
            .collect())
    }
}
