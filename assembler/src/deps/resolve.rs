//! Turning requirements into a concrete package set.
//!
//! Two modes:
//! - frozen: the lockfile must satisfy every requirement, and the installed
//!   set is the lockfile closure at exactly the locked versions;
//! - index resolution: no lockfile, so the highest satisfying version of each
//!   requirement is picked from the index. The result depends on what the
//!   index holds at build time and is flagged non-reproducible.

use super::lockfile::Lockfile;
use super::native::NativeTable;
use super::version::{Requirement, Version};
use crate::installer::PackageIndex;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    /// Requires native compilation (per the native table)
    pub native: bool,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// Sorted by name
    pub packages: Vec<ResolvedPackage>,
    /// Pinned by a lockfile
    pub frozen: bool,
}

impl Resolution {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.iter().map(|p| p.name.as_str())
    }

    pub fn native_names(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|p| p.native)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn has_native(&self) -> bool {
        self.packages.iter().any(|p| p.native)
    }

    /// `name -> version` pins.
    pub fn pins(&self) -> BTreeMap<String, String> {
        self.packages
            .iter()
            .map(|p| (p.name.clone(), p.version.to_string()))
            .collect()
    }

    /// Digest over the sorted `name==version` list.
    pub fn digest(&self) -> String {
        package_set_digest(&self.pins())
    }
}

/// SHA-256 over `name==version\n` lines in name order.
pub fn package_set_digest(pins: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, version) in pins {
        hasher.update(name.as_bytes());
        hasher.update(b"==");
        hasher.update(version.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Check that every requirement is locked at a satisfying version.
pub fn verify_lock(requirements: &[Requirement], lock: &Lockfile) -> AssemblerResult<()> {
    for req in requirements {
        let locked = lock.get(&req.name).ok_or_else(|| {
            AssemblerError::Resolution(format!(
                "manifest requires '{}' but the lockfile has no entry for it",
                req
            ))
        })?;
        if !req.matches(&locked.version) {
            return Err(AssemblerError::Resolution(format!(
                "lockfile pins {}=={} which does not satisfy manifest requirement '{}'",
                locked.name, locked.version, req
            )));
        }
    }
    Ok(())
}

/// Frozen resolution from the lockfile.
pub fn resolve_frozen(
    requirements: &[Requirement],
    lock: &Lockfile,
    native: &NativeTable,
) -> AssemblerResult<Resolution> {
    verify_lock(requirements, lock)?;

    let roots: Vec<String> = requirements.iter().map(|r| r.name.clone()).collect();
    let packages = lock
        .closure(&roots)?
        .into_iter()
        .map(|pkg| ResolvedPackage {
            name: pkg.name.clone(),
            version: pkg.version.clone(),
            native: native.is_native(&pkg.name),
        })
        .collect();

    Ok(Resolution {
        packages,
        frozen: true,
    })
}

/// Manifest-only resolution against the package index.
pub fn resolve_from_index(
    requirements: &[Requirement],
    index: &PackageIndex,
    native: &NativeTable,
) -> AssemblerResult<Resolution> {
    let mut chosen: BTreeMap<String, Version> = BTreeMap::new();
    let mut constraints: BTreeMap<String, Vec<Requirement>> = BTreeMap::new();
    let mut queue: VecDeque<Requirement> = requirements.iter().cloned().collect();

    while let Some(req) = queue.pop_front() {
        constraints
            .entry(req.name.clone())
            .or_default()
            .push(req.clone());

        if let Some(version) = chosen.get(&req.name) {
            if !req.matches(version) {
                return Err(AssemblerError::Resolution(format!(
                    "conflicting requirements: '{}' excludes already selected {}=={}",
                    req, req.name, version
                )));
            }
            continue;
        }

        let all = &constraints[&req.name];
        let candidates: Vec<Version> = index
            .versions(&req.name)?
            .into_iter()
            .filter(|v| all.iter().all(|r| r.matches(v)))
            .collect();

        let allow_pre = all.iter().any(|r| r.specifiers.allows_prereleases());
        let pick = candidates
            .iter()
            .filter(|v| allow_pre || !v.is_prerelease())
            .max()
            .or_else(|| candidates.iter().max())
            .cloned()
            .ok_or_else(|| {
                AssemblerError::Resolution(format!(
                    "no version of '{}' in {} satisfies '{}'",
                    req.name,
                    index.root().display(),
                    req
                ))
            })?;

        tracing::debug!(package = %req.name, version = %pick, "Selected version from index");
        queue.extend(index.requires(&req.name, &pick)?);
        chosen.insert(req.name.clone(), pick);
    }

    let packages = chosen
        .into_iter()
        .map(|(name, version)| ResolvedPackage {
            native: native.is_native(&name),
            name,
            version,
        })
        .collect();

    Ok(Resolution {
        packages,
        frozen: false,
    })
}

/// Resolve requirements, frozen when a lockfile is available.
///
/// The index is only consulted without a lockfile.
pub fn resolve(
    requirements: &[Requirement],
    lock: Option<&Lockfile>,
    index: Option<&PackageIndex>,
    native: &NativeTable,
) -> AssemblerResult<Resolution> {
    match (lock, index) {
        (Some(lock), _) => resolve_frozen(requirements, lock, native),
        (None, Some(index)) => {
            tracing::warn!(
                "No lockfile present; resolving against the index. The resulting package set is not reproducible across builds"
            );
            resolve_from_index(requirements, index, native)
        }
        (None, None) => Err(AssemblerError::Resolution(
            "no lockfile and no package index to resolve against".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn reqs(list: &[&str]) -> Vec<Requirement> {
        list.iter().map(|r| Requirement::parse(r).unwrap()).collect()
    }

    const LOCK: &str = r#"
[[package]]
name = "django"
version = "5.0.6"
dependencies = [{ name = "asgiref" }]

[[package]]
name = "asgiref"
version = "3.8.1"

[[package]]
name = "psycopg2"
version = "2.9.9"
"#;

    #[test]
    fn test_frozen_resolution_pins_locked_versions() {
        let lock = Lockfile::parse(LOCK).unwrap();
        let res = resolve_frozen(
            &reqs(&["Django>=5,<6", "psycopg2"]),
            &lock,
            &NativeTable::builtin(),
        )
        .unwrap();

        assert!(res.frozen);
        assert_eq!(res.pins().get("asgiref").map(String::as_str), Some("3.8.1"));
        assert_eq!(res.native_names(), vec!["psycopg2"]);
        assert_eq!(res.packages.len(), 3);
    }

    #[test]
    fn test_frozen_rejects_unsatisfied_pin() {
        let lock = Lockfile::parse(LOCK).unwrap();
        let err = resolve_frozen(&reqs(&["django>=6"]), &lock, &NativeTable::builtin())
            .unwrap_err();
        assert!(matches!(err, AssemblerError::Resolution(_)));
    }

    #[test]
    fn test_frozen_rejects_missing_entry() {
        let lock = Lockfile::parse(LOCK).unwrap();
        let err = resolve_frozen(&reqs(&["mysqlclient"]), &lock, &NativeTable::builtin())
            .unwrap_err();
        assert!(err.to_string().contains("no entry"));
    }

    #[test]
    fn test_index_resolution_picks_highest_final() {
        let dir = tempfile::tempdir().unwrap();
        for v in ["4.2.13", "5.0.6", "5.1a1"] {
            fs::create_dir_all(dir.path().join("django").join(v)).unwrap();
        }
        fs::create_dir_all(dir.path().join("asgiref/3.8.1")).unwrap();
        fs::write(dir.path().join("django/5.0.6/requires.txt"), "asgiref>=3.7\n").unwrap();

        let index = PackageIndex::open(dir.path()).unwrap();
        let res = resolve(&reqs(&["django>=5"]), None, Some(&index), &NativeTable::builtin()).unwrap();

        assert!(!res.frozen);
        let pins = res.pins();
        assert_eq!(pins["django"], "5.0.6");
        assert_eq!(pins["asgiref"], "3.8.1");
    }

    #[test]
    fn test_resolve_with_lock_ignores_missing_index() {
        let lock = Lockfile::parse(LOCK).unwrap();
        let res = resolve(&reqs(&["django"]), Some(&lock), None, &NativeTable::builtin()).unwrap();
        assert!(res.frozen);
        assert_eq!(res.pins()["asgiref"], "3.8.1");

        let err = resolve(&reqs(&["django"]), None, None, &NativeTable::builtin()).unwrap_err();
        assert!(matches!(err, AssemblerError::Resolution(_)));
    }

    #[test]
    fn test_index_resolution_conflict() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/1.0")).unwrap();
        fs::create_dir_all(dir.path().join("b/2.0")).unwrap();
        fs::write(dir.path().join("a/1.0/requires.txt"), "b<2\n").unwrap();

        let index = PackageIndex::open(dir.path()).unwrap();
        let err = resolve_from_index(&reqs(&["b", "a"]), &index, &NativeTable::builtin())
            .unwrap_err();
        assert!(err.to_string().contains("conflicting"));
    }

    #[test]
    fn test_digest_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), "1".to_string());
        a.insert("a".to_string(), "2".to_string());
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), "2".to_string());
        b.insert("b".to_string(), "1".to_string());
        assert_eq!(package_set_digest(&a), package_set_digest(&b));
    }
}
