//! Task: Prepare stage roots.
//!
//! Creates the scratch work directory and one stage root per domain.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::assemble::types::StageRoots;
use crate::image::StageRoot;
use crate::planner::{BUILDER_STAGE, BuildMode, BuildPlan};
use crate::pipeline::PipelineTask;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use async_trait::async_trait;
use std::path::Path;

pub struct PrepareTask;

#[async_trait]
impl PipelineTask<AssemblyCtx> for PrepareTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let work_dir = ctx.work_dir.clone();
        ctx.guard.set_work_dir(work_dir.clone());

        let roots = prepare_roots(&work_dir, &ctx.plan)
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;
        ctx.roots = Some(roots);

        Ok(())
    }

    fn name(&self) -> &str {
        "prepare"
    }
}

fn prepare_roots(work_dir: &Path, plan: &BuildPlan) -> AssemblerResult<StageRoots> {
    std::fs::create_dir_all(work_dir).map_err(|e| {
        AssemblerError::Storage(format!(
            "Failed to create work directory {}: {}",
            work_dir.display(),
            e
        ))
    })?;

    let final_stage = plan
        .final_stage()
        .ok_or_else(|| AssemblerError::Plan("plan has no final stage".into()))?;
    let final_root = StageRoot::create(work_dir, &final_stage.name, &final_stage.base)?;

    let builder = match plan.mode {
        BuildMode::TwoStage => {
            let stage = plan.stage(BUILDER_STAGE).ok_or_else(|| {
                AssemblerError::Plan("two-stage plan has no builder stage".into())
            })?;
            Some(StageRoot::create(work_dir, &stage.name, &stage.base)?)
        }
        BuildMode::SingleStage => None,
    };

    Ok(StageRoots {
        builder,
        final_root,
    })
}
