//! Task: Dependency install.
//!
//! Builds the venv artifact inside the install domain: the builder in
//! two-stage mode, the single domain otherwise. Native packages are checked
//! against the domain's toolchain before anything is installed.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::assemble::types::InstallInput;
use crate::installer::{InstallReport, InstallRequest, VenvLayout, ensure_native_toolchain};
use crate::pipeline::PipelineTask;
use assembler_shared::errors::AssemblerResult;
use async_trait::async_trait;
use std::collections::BTreeSet;

pub struct DependencyInstallTask;

#[async_trait]
impl PipelineTask<AssemblyCtx> for DependencyInstallTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (options, resolution, native, domain, installer) = {
            let ctx = ctx.lock().await;
            (
                ctx.options.clone(),
                ctx.resolution.clone(),
                ctx.native.clone(),
                ctx.roots()?.install_domain().clone(),
                ctx.installer.clone(),
            )
        };

        let report = run_install(InstallInput {
            options: &options,
            resolution: &resolution,
            native: &native,
            domain: &domain,
            installer,
        })
        .await
        .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        ctx.lock().await.install_output = Some(report);
        Ok(())
    }

    fn name(&self) -> &str {
        "dependency_install"
    }
}

async fn run_install(input: InstallInput<'_>) -> AssemblerResult<InstallReport> {
    let InstallInput {
        options,
        resolution,
        native,
        domain,
        installer,
    } = input;

    let toolchain: BTreeSet<String> = options.toolchain.packages.iter().cloned().collect();
    ensure_native_toolchain(
        &domain.system_packages()?,
        &resolution.packages,
        native,
        &toolchain,
    )?;

    let venv = VenvLayout::new(domain.resolve(&options.image.venv_path)?, &options.image.python);
    let request = InstallRequest::new(options.project.root.clone(), resolution, venv);
    let report = installer.install(request).await?;

    tracing::info!(
        installer = %report.installer,
        domain = domain.name(),
        packages = report.packages.len(),
        reproducible = report.reproducible,
        digest = %report.digest(),
        "Installed dependencies"
    );
    Ok(report)
}
