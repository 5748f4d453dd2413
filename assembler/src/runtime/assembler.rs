//! Assembler facade: the entry point the CLI and tests drive.

use super::layout::StateLayout;
use super::options::{AssemblerOptions, InstallerKind};
use crate::assemble::{AssemblyInputs, AssemblyOutput, CommandTestRunner, ImageBuilder, TestRunner};
use crate::db::{BuildRecord, BuildStore};
use crate::deps::{Lockfile, Manifest, NativeTable, Resolution, resolve};
use crate::installer::{CommandInstaller, IndexInstaller, PackageIndex, PackageInstaller, pin_drift};
use crate::planner::{BuildPlan, StagePlanner, dockerfile};
use crate::verify::{VerifyReport, verify_image};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

/// Inputs read from the project before planning.
#[derive(Debug, Clone)]
pub struct ResolvedProject {
    pub manifest: Manifest,
    pub lock: Option<Lockfile>,
    pub index: Option<PackageIndex>,
    pub resolution: Resolution,
}

pub struct Assembler {
    options: AssemblerOptions,
    state: StateLayout,
    native: NativeTable,
    builds: BuildStore,
    installer: Option<Arc<dyn PackageInstaller>>,
    test_runner: Arc<dyn TestRunner>,
}

impl Assembler {
    pub fn new(options: AssemblerOptions, state: StateLayout) -> AssemblerResult<Self> {
        options.sanitize()?;
        state.prepare()?;

        let builds = BuildStore::open(&state.db_path()).map_err(|e| {
            AssemblerError::Storage(format!(
                "Failed to initialize database at {}: {}",
                state.db_path().display(),
                e
            ))
        })?;
        let native = NativeTable::with_overrides(&options.native);

        tracing::debug!(
            root = %options.project.root.display(),
            state = %state.root().display(),
            "Initialized assembler"
        );

        Ok(Self {
            options,
            state,
            native,
            builds,
            installer: None,
            test_runner: Arc::new(CommandTestRunner),
        })
    }

    /// Replace the installer chosen from `project.installer`.
    pub fn with_installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn with_test_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.test_runner = runner;
        self
    }

    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    pub fn state(&self) -> &StateLayout {
        &self.state
    }

    /// Read the manifest and lockfile and resolve the runtime package set.
    pub fn resolve(&self) -> AssemblerResult<ResolvedProject> {
        let project = &self.options.project;
        let manifest = Manifest::load(&project.manifest_path())?;
        let lock = Lockfile::load_optional(&project.lockfile_path())?;

        let index_needed = lock.is_none() || project.installer == InstallerKind::Index;
        let index = if index_needed || project.index_path().is_dir() {
            Some(PackageIndex::open(&project.index_path())?)
        } else {
            None
        };

        let resolution = resolve(&manifest.dependencies, lock.as_ref(), index.as_ref(), &self.native)?;

        tracing::info!(
            packages = resolution.packages.len(),
            native = resolution.native_names().len(),
            frozen = resolution.frozen,
            "Resolved dependencies"
        );

        Ok(ResolvedProject {
            manifest,
            lock,
            index,
            resolution,
        })
    }

    pub fn plan(&self) -> AssemblerResult<BuildPlan> {
        let project = self.resolve()?;
        StagePlanner::new(&self.options, &self.native).plan(&project.resolution)
    }

    /// Plan rendered as a multi-stage Dockerfile.
    pub fn dockerfile(&self) -> AssemblerResult<String> {
        dockerfile::render(&self.plan()?)
    }

    /// Assemble the image into `output` and record the build.
    pub async fn build(&self, output: &Path) -> AssemblerResult<AssemblyOutput> {
        let build_id = ulid::Ulid::new().to_string();
        let project = self.resolve()?;
        let plan = StagePlanner::new(&self.options, &self.native).plan(&project.resolution)?;
        let installer = self.installer_for(project.index.as_ref())?;

        tracing::info!(
            build_id = %build_id,
            mode = %plan.mode,
            installer = installer.name(),
            output = %output.display(),
            "Starting build"
        );

        let inputs = AssemblyInputs {
            build_id: build_id.clone(),
            options: self.options.clone(),
            manifest: project.manifest,
            lock: project.lock.clone(),
            index: project.index,
            native: self.native.clone(),
            resolution: project.resolution,
            plan,
            installer,
            test_runner: Arc::clone(&self.test_runner),
            work_dir: self.state.work_dir(&build_id),
            output: output.to_path_buf(),
        };
        let result = ImageBuilder::new(inputs)?.build().await?;

        let record = BuildRecord {
            id: result.build_id.clone(),
            created_at: Utc::now(),
            mode: result.plan.mode,
            lock_digest: project.lock.as_ref().map(|l| l.digest().to_string()),
            package_digest: result.install.digest(),
            image_digest: result.image.manifest_digest.clone(),
            reproducible: result.install.reproducible,
            packages: result.install.packages.clone(),
            output: result.output.clone(),
        };
        if let Err(e) = self.check_reproducibility(&record) {
            if let Err(rm) = std::fs::remove_dir_all(&result.output) {
                tracing::warn!(output = %result.output.display(), error = %rm, "Failed to remove rejected image");
            }
            return Err(e);
        }
        self.builds.save(&record)?;

        Ok(result)
    }

    /// Reject a build whose lockfile already produced a different package
    /// set in an earlier build.
    fn check_reproducibility(&self, record: &BuildRecord) -> AssemblerResult<()> {
        let Some(lock_digest) = &record.lock_digest else {
            return Ok(());
        };
        for previous in self.builds.find_by_lock_digest(lock_digest)? {
            if previous.package_digest == record.package_digest {
                continue;
            }
            let drift = pin_drift(&previous.packages, &record.packages);
            tracing::error!(
                build_id = %record.id,
                previous = %previous.id,
                lock_digest = %lock_digest,
                drift = ?drift,
                "Reproducibility violation: same lockfile produced a different package set"
            );
            return Err(AssemblerError::Install(format!(
                "lockfile {} installed a different package set than build {}: {}",
                lock_digest,
                previous.id,
                drift.join(", ")
            )));
        }
        Ok(())
    }

    fn installer_for(&self, index: Option<&PackageIndex>) -> AssemblerResult<Arc<dyn PackageInstaller>> {
        if let Some(installer) = &self.installer {
            return Ok(Arc::clone(installer));
        }
        match self.options.project.installer {
            InstallerKind::Index => {
                let index = index.cloned().ok_or_else(|| {
                    AssemblerError::Config("index installer requires a package index".into())
                })?;
                Ok(Arc::new(
                    IndexInstaller::new(index, self.native.clone())
                        .with_mtime(self.options.image.source_date_epoch),
                ))
            }
            InstallerKind::Command => {
                let (program, args) = self
                    .options
                    .project
                    .installer_command
                    .split_first()
                    .ok_or_else(|| AssemblerError::Config("empty installer command".into()))?;
                Ok(Arc::new(CommandInstaller::new(program.clone(), args.to_vec())))
            }
        }
    }

    pub fn verify(&self, image_dir: &Path) -> AssemblerResult<VerifyReport> {
        verify_image(image_dir, &self.options.image.venv_path, &self.options.image.python)
    }

    /// Most recent builds first.
    pub fn history(&self, limit: usize) -> AssemblerResult<Vec<BuildRecord>> {
        self.builds.list(limit)
    }
}
