//! Assembler configuration.
//!
//! Loaded from `assembler.toml` at the build root; every field has a default
//! so an empty (or missing) file yields a working configuration for a
//! `pyproject.toml` + `uv.lock` project.

use crate::deps::NativePackage;
use crate::image::{EnvironmentOptions, RuntimeIdentity};
use crate::planner::{OwnershipPolicy, PlanMode};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "assembler.toml";

/// Which `PackageInstaller` implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallerKind {
    /// Materialize packages from the local index.
    #[default]
    Index,
    /// Run the external package manager.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectOptions {
    /// Build root. Relative paths below resolve against it.
    pub root: PathBuf,
    pub manifest: PathBuf,
    pub lockfile: PathBuf,
    /// Local package index directory.
    pub index: PathBuf,
    pub installer: InstallerKind,
    /// Program and leading arguments for the command installer.
    pub installer_command: Vec<String>,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            manifest: PathBuf::from("pyproject.toml"),
            lockfile: PathBuf::from("uv.lock"),
            index: PathBuf::from("index"),
            installer: InstallerKind::Index,
            installer_command: vec![
                "uv".to_string(),
                "sync".to_string(),
                "--no-install-project".to_string(),
            ],
        }
    }
}

impl ProjectOptions {
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest)
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.root.join(&self.lockfile)
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(&self.index)
    }

    pub fn manifest_name(&self) -> String {
        self.manifest.display().to_string()
    }

    pub fn lockfile_name(&self) -> String {
        self.lockfile.display().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// Runtime base image, pinned to a Python version.
    pub base: String,
    /// Base for the builder stage. Defaults to `base`.
    pub builder_base: Option<String>,
    /// Interpreter `X.Y` version of the base image.
    pub python: String,
    pub workdir: PathBuf,
    pub venv_path: PathBuf,
    /// Reference recorded in the OCI index.
    pub name: String,
    pub cmd: Vec<String>,
    /// mtime for every layer entry and the image creation time.
    pub source_date_epoch: u64,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            base: "python:3.12-slim".to_string(),
            builder_base: None,
            python: "3.12".to_string(),
            workdir: PathBuf::from("/app"),
            venv_path: PathBuf::from("/app/.venv"),
            name: "app:latest".to_string(),
            cmd: vec![
                "gunicorn".to_string(),
                "etc.wsgi:application".to_string(),
                "--bind".to_string(),
                "0.0.0.0:8000".to_string(),
            ],
            source_date_epoch: 0,
        }
    }
}

impl ImageOptions {
    pub fn builder_base(&self) -> &str {
        self.builder_base.as_deref().unwrap_or(&self.base)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub mode: PlanMode,
    pub ownership: OwnershipPolicy,
    /// Run the dev-dependency test stage before the final stage.
    pub test_stage: bool,
    pub test_command: Vec<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: PlanMode::Auto,
            ownership: OwnershipPolicy::Explicit,
            test_stage: false,
            test_command: vec![
                "python".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainOptions {
    /// Compiler toolchain installed in the builder domain.
    pub packages: Vec<String>,
}

impl Default for ToolchainOptions {
    fn default() -> Self {
        Self {
            packages: vec!["build-essential".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerOptions {
    pub project: ProjectOptions,
    pub image: ImageOptions,
    pub identity: RuntimeIdentity,
    pub environment: EnvironmentOptions,
    pub pipeline: PipelineOptions,
    pub toolchain: ToolchainOptions,
    /// Extra or replacement native-extension mappings.
    pub native: BTreeMap<String, NativePackage>,
}

impl AssemblerOptions {
    pub fn parse(content: &str) -> AssemblerResult<Self> {
        toml::from_str(content)
            .map_err(|e| AssemblerError::Config(format!("invalid {}: {}", CONFIG_FILE, e)))
    }

    /// Load `path`, resolving a relative `project.root` against the file's
    /// directory.
    pub fn load(path: &Path) -> AssemblerResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AssemblerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut options = Self::parse(&content)?;
        let base = path.parent().unwrap_or(Path::new("."));
        if options.project.root.is_relative() {
            options.project.root = base.join(&options.project.root);
        }
        tracing::debug!(config = %path.display(), "Loaded assembler options");
        Ok(options)
    }

    /// Load `<root>/assembler.toml` if present, otherwise defaults rooted at
    /// `root`.
    pub fn discover(root: &Path) -> AssemblerResult<Self> {
        let path = root.join(CONFIG_FILE);
        if path.is_file() {
            return Self::load(&path);
        }
        Ok(Self {
            project: ProjectOptions {
                root: root.to_path_buf(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Reject configurations that cannot produce a valid image.
    pub fn sanitize(&self) -> AssemblerResult<()> {
        if self.image.base.trim().is_empty() {
            return Err(AssemblerError::Config("image.base must not be empty".into()));
        }
        if self.image.builder_base().trim().is_empty() {
            return Err(AssemblerError::Config(
                "image.builder_base must not be empty".into(),
            ));
        }
        let python_ok = {
            let mut parts = self.image.python.split('.');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(major), Some(minor), None)
                    if !major.is_empty()
                        && !minor.is_empty()
                        && major.chars().all(|c| c.is_ascii_digit())
                        && minor.chars().all(|c| c.is_ascii_digit())
            )
        };
        if !python_ok {
            return Err(AssemblerError::Config(format!(
                "image.python must look like X.Y, got '{}'",
                self.image.python
            )));
        }
        for (field, path) in [
            ("image.workdir", &self.image.workdir),
            ("image.venv_path", &self.image.venv_path),
        ] {
            if !path.is_absolute() {
                return Err(AssemblerError::Config(format!(
                    "{} must be an absolute path, got {}",
                    field,
                    path.display()
                )));
            }
            crate::image::image_relative(path)?;
        }
        if self.image.name.trim().is_empty() {
            return Err(AssemblerError::Config("image.name must not be empty".into()));
        }
        if self.pipeline.test_stage && self.pipeline.test_command.is_empty() {
            return Err(AssemblerError::Config(
                "pipeline.test_command must not be empty when the test stage is enabled".into(),
            ));
        }
        if self.project.installer == InstallerKind::Command
            && self.project.installer_command.is_empty()
        {
            return Err(AssemblerError::Config(
                "project.installer_command must not be empty".into(),
            ));
        }
        self.environment.validate()?;
        self.identity.validate()?;
        Ok(())
    }
}
