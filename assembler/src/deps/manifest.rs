//! Dependency manifest (`pyproject.toml`).
//!
//! Runtime requirements come from `[project].dependencies`. Development
//! requirements come from the `dev` dependency group (PEP 735), following
//! `include-group` references, and from the `dev` optional-dependency extra.

use super::version::{Requirement, SpecifierSet};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const DEV_GROUP: &str = "dev";

#[derive(Debug, Deserialize)]
struct PyProject {
    project: Option<ProjectTable>,
    #[serde(rename = "dependency-groups", default)]
    dependency_groups: BTreeMap<String, Vec<toml::Value>>,
}

#[derive(Debug, Deserialize)]
struct ProjectTable {
    name: String,
    version: Option<String>,
    #[serde(rename = "requires-python")]
    requires_python: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(rename = "optional-dependencies", default)]
    optional_dependencies: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub name: String,
    pub version: Option<String>,
    pub requires_python: Option<SpecifierSet>,
    pub dependencies: Vec<Requirement>,
    pub dev_dependencies: Vec<Requirement>,
}

impl Manifest {
    /// Read and parse the manifest at `path`.
    pub fn load(path: &Path) -> AssemblerResult<Self> {
        if !path.is_file() {
            return Err(AssemblerError::Manifest(format!(
                "dependency manifest not found at {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            AssemblerError::Manifest(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
            .map_err(|e| AssemblerError::Manifest(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> AssemblerResult<Self> {
        let raw: PyProject = toml::from_str(content)
            .map_err(|e| AssemblerError::Manifest(format!("invalid TOML: {}", e)))?;

        let project = raw
            .project
            .ok_or_else(|| AssemblerError::Manifest("missing [project] table".into()))?;

        let requires_python = project
            .requires_python
            .as_deref()
            .map(SpecifierSet::parse)
            .transpose()?;

        let dependencies = parse_requirements(&project.dependencies)?;

        let mut dev_raw = expand_group(&raw.dependency_groups, DEV_GROUP, &mut BTreeSet::new())?;
        if let Some(extra) = project.optional_dependencies.get(DEV_GROUP) {
            dev_raw.extend(extra.iter().cloned());
        }
        let dev_dependencies = parse_requirements(&dev_raw)?;

        Ok(Self {
            name: project.name,
            version: project.version,
            requires_python,
            dependencies,
            dev_dependencies,
        })
    }

    /// Normalized names of the runtime requirements.
    pub fn runtime_names(&self) -> Vec<String> {
        self.dependencies.iter().map(|r| r.name.clone()).collect()
    }

    pub fn has_dev_dependencies(&self) -> bool {
        !self.dev_dependencies.is_empty()
    }
}

fn parse_requirements(raw: &[String]) -> AssemblerResult<Vec<Requirement>> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for entry in raw {
        let req = Requirement::parse(entry)?;
        if seen.insert(req.name.clone()) {
            out.push(req);
        }
    }
    Ok(out)
}

fn expand_group(
    groups: &BTreeMap<String, Vec<toml::Value>>,
    name: &str,
    visiting: &mut BTreeSet<String>,
) -> AssemblerResult<Vec<String>> {
    let Some(entries) = groups.get(name) else {
        return Ok(Vec::new());
    };
    if !visiting.insert(name.to_string()) {
        return Err(AssemblerError::Manifest(format!(
            "dependency group '{}' includes itself",
            name
        )));
    }

    let mut out = Vec::new();
    for entry in entries {
        match entry {
            toml::Value::String(req) => out.push(req.clone()),
            toml::Value::Table(table) => {
                let include = table
                    .get("include-group")
                    .and_then(toml::Value::as_str)
                    .ok_or_else(|| {
                        AssemblerError::Manifest(format!(
                            "unsupported entry in dependency group '{}'",
                            name
                        ))
                    })?;
                out.extend(expand_group(groups, include, visiting)?);
            }
            _ => {
                return Err(AssemblerError::Manifest(format!(
                    "unsupported entry in dependency group '{}'",
                    name
                )));
            }
        }
    }

    visiting.remove(name);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYPROJECT: &str = r#"
[project]
name = "kyc"
version = "0.1.0"
requires-python = ">=3.12"
dependencies = [
    "Django>=5.0,<6",
    "djangorestframework>=3.15",
    "psycopg2==2.9.9",
]

[dependency-groups]
lint = ["ruff>=0.4"]
dev = [
    "pytest>=8",
    "pytest-django>=4.8",
    { include-group = "lint" },
]
"#;

    #[test]
    fn test_parse_runtime_and_dev() {
        let manifest = Manifest::parse(PYPROJECT).unwrap();
        assert_eq!(manifest.name, "kyc");
        assert_eq!(
            manifest.runtime_names(),
            vec!["django", "djangorestframework", "psycopg2"]
        );
        let dev: Vec<_> = manifest
            .dev_dependencies
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(dev, vec!["pytest", "pytest-django", "ruff"]);
        assert!(manifest.requires_python.is_some());
    }

    #[test]
    fn test_missing_project_table() {
        let err = Manifest::parse("[tool.uv]\n").unwrap_err();
        assert!(err.to_string().contains("[project]"));
    }

    #[test]
    fn test_self_including_group_rejected() {
        let content = r#"
[project]
name = "x"
[dependency-groups]
dev = [{ include-group = "dev" }]
"#;
        assert!(Manifest::parse(content).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::load(&dir.path().join("pyproject.toml")).unwrap_err();
        assert!(matches!(err, AssemblerError::Manifest(_)));
    }
}
