//! Type definitions for the assembly pipeline.

use crate::deps::{Lockfile, Manifest, NativeTable, Resolution};
use crate::image::{Layer, StageRoot, WrittenImage};
use crate::installer::{InstallReport, PackageIndex, PackageInstaller, VenvLayout};
use crate::planner::BuildPlan;
use crate::runtime::AssemblerOptions;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

/// Runs the test command of the optional test stage.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run `command` in `workdir` against the dev environment `venv`.
    async fn run(&self, command: &[String], workdir: &Path, venv: &VenvLayout)
    -> AssemblerResult<()>;
}

/// Spawns the test command with the dev venv activated.
pub struct CommandTestRunner;

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(
        &self,
        command: &[String],
        workdir: &Path,
        venv: &VenvLayout,
    ) -> AssemblerResult<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AssemblerError::Config("empty test command".into()))?;

        let path = format!(
            "{}:{}",
            venv.bin_dir().display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let status = tokio::process::Command::new(program)
            .args(args)
            .current_dir(workdir)
            .env("VIRTUAL_ENV", venv.root())
            .env("PATH", path)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| AssemblerError::TestFailure(format!("failed to run {}: {}", program, e)))?;

        if !status.success() {
            return Err(AssemblerError::TestFailure(format!(
                "{} exited with {}",
                command.join(" "),
                status
            )));
        }
        Ok(())
    }
}

/// Everything a build needs, gathered before the pipeline starts.
pub struct AssemblyInputs {
    pub build_id: String,
    pub options: AssemblerOptions,
    pub manifest: Manifest,
    pub lock: Option<Lockfile>,
    pub index: Option<PackageIndex>,
    pub native: NativeTable,
    pub resolution: Resolution,
    pub plan: BuildPlan,
    pub installer: Arc<dyn PackageInstaller>,
    pub test_runner: Arc<dyn TestRunner>,
    /// Scratch directory for stage roots, removed after the build.
    pub work_dir: PathBuf,
    /// Final image layout location.
    pub output: PathBuf,
}

/// RAII guard for cleanup on assembly failure.
///
/// Removes the staging output if dropped while armed. The scratch work
/// directory is removed unconditionally.
pub struct CleanupGuard {
    build_id: String,
    work_dir: Option<PathBuf>,
    staging: Option<PathBuf>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(build_id: &str) -> Self {
        Self {
            build_id: build_id.to_string(),
            work_dir: None,
            staging: None,
            armed: true,
        }
    }

    pub fn set_work_dir(&mut self, path: PathBuf) {
        self.work_dir = Some(path);
    }

    pub fn set_staging(&mut self, path: PathBuf) {
        self.staging = Some(path);
    }

    /// Staging directory was renamed into place.
    pub fn take_staging(&mut self) -> Option<PathBuf> {
        self.staging.take()
    }

    /// Disarm the guard (call on success).
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(ref work_dir) = self.work_dir
            && work_dir.exists()
            && let Err(e) = std::fs::remove_dir_all(work_dir)
        {
            tracing::warn!(build_id = %self.build_id, "Failed to remove work directory: {}", e);
        }

        if !self.armed {
            return;
        }

        tracing::warn!(build_id = %self.build_id, "Assembly failed, cleaning up");

        if let Some(ref staging) = self.staging
            && staging.exists()
            && let Err(e) = std::fs::remove_dir_all(staging)
        {
            tracing::warn!(build_id = %self.build_id, "Failed to remove staging output: {}", e);
        }
    }
}

/// Shared assembly pipeline context.
///
/// Inputs are fixed at construction; each task fills in its output slot.
pub struct AssemblyContext {
    pub build_id: String,
    pub options: AssemblerOptions,
    pub manifest: Manifest,
    pub lock: Option<Lockfile>,
    pub index: Option<PackageIndex>,
    pub native: NativeTable,
    pub resolution: Resolution,
    pub plan: BuildPlan,
    pub installer: Arc<dyn PackageInstaller>,
    pub test_runner: Arc<dyn TestRunner>,
    pub work_dir: PathBuf,
    pub output: PathBuf,
    pub guard: CleanupGuard,
    pub roots: Option<StageRoots>,
    pub install_output: Option<InstallReport>,
    pub test_output: Option<TestOutput>,
    pub identity_created: bool,
    pub copy_output: Option<CopyOutput>,
    pub export_output: Option<ExportOutput>,
}

impl AssemblyContext {
    pub fn new(inputs: AssemblyInputs) -> Self {
        let guard = CleanupGuard::new(&inputs.build_id);
        Self {
            build_id: inputs.build_id,
            options: inputs.options,
            manifest: inputs.manifest,
            lock: inputs.lock,
            index: inputs.index,
            native: inputs.native,
            resolution: inputs.resolution,
            plan: inputs.plan,
            installer: inputs.installer,
            test_runner: inputs.test_runner,
            work_dir: inputs.work_dir,
            output: inputs.output,
            guard,
            roots: None,
            install_output: None,
            test_output: None,
            identity_created: false,
            copy_output: None,
            export_output: None,
        }
    }

    pub fn roots(&self) -> AssemblerResult<&StageRoots> {
        self.roots
            .as_ref()
            .ok_or_else(|| AssemblerError::Internal("prepare task must run first".into()))
    }
}

// ============================================================================
// STAGE INPUT/OUTPUT TYPES
// ============================================================================

/// On-disk domains of the build.
#[derive(Debug, Clone)]
pub struct StageRoots {
    /// Present in two-stage mode only.
    pub builder: Option<StageRoot>,
    pub final_root: StageRoot,
}

impl StageRoots {
    /// Domain dependencies are installed in.
    pub fn install_domain(&self) -> &StageRoot {
        self.builder.as_ref().unwrap_or(&self.final_root)
    }
}

/// Input for the dependency install stage.
pub struct InstallInput<'a> {
    pub options: &'a AssemblerOptions,
    pub resolution: &'a Resolution,
    pub native: &'a NativeTable,
    pub domain: &'a StageRoot,
    pub installer: Arc<dyn PackageInstaller>,
}

/// Output of the test stage.
#[derive(Debug, Clone)]
pub struct TestOutput {
    pub dev_packages: usize,
}

/// Input for the runtime copy stage.
pub struct CopyInput<'a> {
    pub options: &'a AssemblerOptions,
    pub plan: &'a BuildPlan,
    pub venv_source: PathBuf,
    pub excludes: Vec<PathBuf>,
}

/// Layers carrying the copied venv and application tree.
pub struct CopyOutput {
    pub venv_layer: Layer,
    pub app_layer: Layer,
}

/// Output of the export stage.
#[derive(Debug, Clone)]
pub struct ExportOutput {
    pub image: WrittenImage,
    pub output: PathBuf,
}
