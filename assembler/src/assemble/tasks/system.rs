//! Task: System packages.
//!
//! Installs the system packages a stage plan names into that stage's
//! domain. In two-stage mode the builder and final domains run in parallel.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::image::StageRoot;
use crate::pipeline::PipelineTask;
use crate::planner::{BUILDER_STAGE, FINAL_STAGE};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::collections::BTreeSet;

pub struct SystemPackagesTask {
    stage: &'static str,
}

impl SystemPackagesTask {
    pub fn builder() -> Self {
        Self {
            stage: BUILDER_STAGE,
        }
    }

    pub fn final_stage() -> Self {
        Self { stage: FINAL_STAGE }
    }
}

#[async_trait]
impl PipelineTask<AssemblyCtx> for SystemPackagesTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (root, packages) = {
            let ctx = ctx.lock().await;
            let roots = ctx.roots()?;
            let root = if self.stage == BUILDER_STAGE {
                roots.builder.clone().ok_or_else(|| {
                    AssemblerError::Internal("builder domain was not prepared".into())
                })?
            } else {
                roots.final_root.clone()
            };
            let packages = ctx
                .plan
                .stage(self.stage)
                .map(|s| s.system_packages())
                .unwrap_or_default();
            (root, packages)
        };

        install_packages(&root, &packages)
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        Ok(())
    }

    fn name(&self) -> &str {
        if self.stage == BUILDER_STAGE {
            "builder_system_packages"
        } else {
            "final_system_packages"
        }
    }
}

fn install_packages(root: &StageRoot, packages: &BTreeSet<String>) -> AssemblerResult<()> {
    if packages.is_empty() {
        tracing::debug!(stage = root.name(), "No system packages to install");
        return Ok(());
    }
    root.install_system_packages(packages)?;
    Ok(())
}
