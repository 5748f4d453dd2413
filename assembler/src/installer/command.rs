//! Installer that delegates to an external package manager.

use super::{InstallReport, InstallRequest, PackageInstaller, pin_drift};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Runs `<program> <args>` in the project root with the venv location
/// exported as `UV_PROJECT_ENVIRONMENT`.
///
/// Defaults to `uv sync --no-install-project`; `--frozen` is added when the
/// package set comes from a lockfile and `--no-dev` unless the dev group is
/// requested.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
}

impl Default for CommandInstaller {
    fn default() -> Self {
        Self {
            program: "uv".to_string(),
            args: vec!["sync".to_string(), "--no-install-project".to_string()],
        }
    }
}

impl CommandInstaller {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Full argument list for `request`.
    pub fn command_args(&self, request: &InstallRequest) -> Vec<String> {
        let mut args = self.args.clone();
        if request.frozen {
            args.push("--frozen".to_string());
        }
        if !request.include_dev {
            args.push("--no-dev".to_string());
        }
        args
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    fn name(&self) -> &str {
        "command"
    }

    async fn install(&self, request: InstallRequest) -> AssemblerResult<InstallReport> {
        let args = self.command_args(&request);
        tracing::info!(
            program = %self.program,
            args = ?args,
            venv = %request.venv.root().display(),
            "Running external installer"
        );

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .current_dir(&request.project_root)
            .env("UV_PROJECT_ENVIRONMENT", request.venv.root())
            .env("UV_PYTHON", request.venv.python())
            .output()
            .await
            .map_err(|e| {
                AssemblerError::Install(format!("failed to run {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(20).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(AssemblerError::Install(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                tail.join("\n")
            )));
        }

        let installed = request.venv.pins()?;
        if request.frozen && !request.include_dev {
            let pinned: BTreeMap<String, String> = request
                .packages
                .iter()
                .map(|p| (p.name.clone(), p.version.to_string()))
                .collect();
            let drift = pin_drift(&pinned, &installed);
            if !drift.is_empty() {
                tracing::error!(
                    program = %self.program,
                    drift = ?drift,
                    "External installer diverged from the lockfile"
                );
                return Err(AssemblerError::Install(format!(
                    "{} installed a package set that differs from the lockfile: {}",
                    self.program,
                    drift.join(", ")
                )));
            }
        }

        Ok(InstallReport {
            installer: self.name().to_string(),
            packages: installed,
            reproducible: request.frozen,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{ResolvedPackage, Version};
    use crate::installer::VenvLayout;
    use std::path::PathBuf;

    fn request(frozen: bool, include_dev: bool) -> InstallRequest {
        InstallRequest {
            project_root: PathBuf::from("/src"),
            packages: Vec::new(),
            frozen,
            include_dev,
            venv: VenvLayout::new("/src/.venv", "3.12"),
        }
    }

    #[test]
    fn test_default_args() {
        let installer = CommandInstaller::default();
        assert_eq!(
            installer.command_args(&request(true, false)),
            vec!["sync", "--no-install-project", "--frozen", "--no-dev"]
        );
        assert_eq!(
            installer.command_args(&request(false, true)),
            vec!["sync", "--no-install-project"]
        );
    }

    #[tokio::test]
    async fn test_frozen_install_rejects_drift() {
        let dir = tempfile::tempdir().unwrap();
        let venv = VenvLayout::new(dir.path().join("venv"), "3.12");
        let site = venv.site_packages();
        let script = format!(
            "mkdir -p {site}/django-9.9.9.dist-info && printf 'Name: django\\nVersion: 9.9.9\\n' > {site}/django-9.9.9.dist-info/METADATA",
            site = site.display()
        );
        let installer = CommandInstaller::new("sh", vec!["-c".to_string(), script]);

        let req = InstallRequest {
            project_root: dir.path().to_path_buf(),
            packages: vec![ResolvedPackage {
                name: "django".into(),
                version: Version::parse("5.0.6").unwrap(),
                native: false,
            }],
            frozen: true,
            include_dev: false,
            venv,
        };
        let err = installer.install(req).await.unwrap_err();
        match err {
            AssemblerError::Install(msg) => assert!(msg.contains("django: 5.0.6 -> 9.9.9"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failing_command_is_install_error() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new("false", Vec::new());
        let mut req = request(true, false);
        req.project_root = dir.path().to_path_buf();
        let err = installer.install(req).await.unwrap_err();
        assert!(matches!(err, AssemblerError::Install(_)));
    }
}
