//! Task: Test stage.
//!
//! Installs runtime plus dev dependencies into a throwaway venv and runs the
//! test command against the source tree. Nothing it produces reaches the
//! image.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::assemble::types::TestOutput;
use crate::deps::{Requirement, resolve};
use crate::installer::{InstallRequest, PackageIndex, VenvLayout};
use crate::pipeline::PipelineTask;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;

pub struct TestStageTask;

#[async_trait]
impl PipelineTask<AssemblyCtx> for TestStageTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, requirements, lock, index, native, installer, runner, work_dir) = {
            let ctx = ctx.lock().await;
            let mut requirements: Vec<Requirement> = ctx.manifest.dependencies.clone();
            requirements.extend(ctx.manifest.dev_dependencies.iter().cloned());
            (
                ctx.options.clone(),
                requirements,
                ctx.lock.clone(),
                ctx.index.clone(),
                ctx.native.clone(),
                ctx.installer.clone(),
                ctx.test_runner.clone(),
                ctx.work_dir.clone(),
            )
        };

        let result = async {
            // Dev packages come from the lockfile when there is one.
            let index = match (&lock, index) {
                (None, None) => Some(PackageIndex::open(&options.project.index_path())?),
                (_, index) => index,
            };
            let resolution = resolve(&requirements, lock.as_ref(), index.as_ref(), &native)?;

            let venv = VenvLayout::new(work_dir.join("test-venv"), &options.image.python);
            let request =
                InstallRequest::new(options.project.root.clone(), &resolution, venv.clone())
                    .with_dev(true);
            let report = installer.install(request).await?;

            tracing::info!(
                build_id = %build_id,
                command = ?options.pipeline.test_command,
                packages = report.packages.len(),
                "Running test stage"
            );
            runner
                .run(&options.pipeline.test_command, &options.project.root, &venv)
                .await?;

            Ok::<TestOutput, AssemblerError>(TestOutput {
                dev_packages: report.packages.len(),
            })
        }
        .await
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        ctx.lock().await.test_output = Some(result);
        Ok(())
    }

    fn name(&self) -> &str {
        "test_stage"
    }
}
