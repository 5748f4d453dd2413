//! Task: Runtime identity.
//!
//! Creates the non-privileged user in the final domain. Runs before any
//! copy into the final domain.

use super::{AssemblyCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use assembler_shared::errors::AssemblerResult;
use async_trait::async_trait;

pub struct RuntimeIdentityTask;

#[async_trait]
impl PipelineTask<AssemblyCtx> for RuntimeIdentityTask {
    async fn run(self: Box<Self>, ctx: AssemblyCtx) -> AssemblerResult<()> {
        let task_name = self.name();
        let build_id = task_start(&ctx, task_name).await;

        let (identity, root) = {
            let ctx = ctx.lock().await;
            (ctx.plan.identity.clone(), ctx.roots()?.final_root.clone())
        };

        identity
            .create_in(&root)
            .inspect_err(|e| log_task_error(&build_id, task_name, e))?;

        ctx.lock().await.identity_created = true;
        Ok(())
    }

    fn name(&self) -> &str {
        "runtime_identity"
    }
}
