//! Native-extension package table.
//!
//! Maps a Python distribution to the system packages its C extension needs:
//! `build` packages (development headers, build tools) go into the builder
//! domain only, `runtime` packages (shared libraries) go into the final
//! domain. The sets are asymmetric on purpose.

use super::version::normalize_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativePackage {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub runtime: Vec<String>,
}

impl NativePackage {
    fn new(build: &[&str], runtime: &[&str]) -> Self {
        Self {
            build: build.iter().map(|s| s.to_string()).collect(),
            runtime: runtime.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NativeTable {
    entries: BTreeMap<String, NativePackage>,
}

impl NativeTable {
    /// Well-known Debian package mappings for common database drivers and
    /// XML/image libraries.
    pub fn builtin() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "psycopg2".to_string(),
            NativePackage::new(&["libpq-dev"], &["libpq5"]),
        );
        entries.insert(
            "mysqlclient".to_string(),
            NativePackage::new(
                &["default-libmysqlclient-dev", "pkg-config"],
                &["libmariadb3"],
            ),
        );
        entries.insert(
            "lxml".to_string(),
            NativePackage::new(&["libxml2-dev", "libxslt1-dev"], &["libxml2", "libxslt1.1"]),
        );
        entries.insert(
            "pillow".to_string(),
            NativePackage::new(&["libjpeg-dev", "zlib1g-dev"], &["libjpeg62-turbo", "zlib1g"]),
        );
        Self { entries }
    }

    /// Built-in table with user entries layered on top. A user entry replaces
    /// the built-in one for the same distribution.
    pub fn with_overrides(overrides: &BTreeMap<String, NativePackage>) -> Self {
        let mut table = Self::builtin();
        for (name, pkg) in overrides {
            table.entries.insert(normalize_name(name), pkg.clone());
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<&NativePackage> {
        self.entries.get(&normalize_name(name))
    }

    pub fn is_native(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Union of build packages for the given distributions.
    pub fn build_packages<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        names
            .into_iter()
            .filter_map(|n| self.get(n))
            .flat_map(|p| p.build.iter().cloned())
            .collect()
    }

    /// Union of runtime libraries for the given distributions.
    pub fn runtime_packages<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        names
            .into_iter()
            .filter_map(|n| self.get(n))
            .flat_map(|p| p.runtime.iter().cloned())
            .collect()
    }
}
