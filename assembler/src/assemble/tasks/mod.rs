//! Assembly pipeline tasks.

mod copy;
mod dependencies;
mod export;
mod identity;
mod prepare;
mod system;
mod test_stage;

pub use copy::RuntimeCopyTask;
pub use dependencies::DependencyInstallTask;
pub use export::ImageExportTask;
pub use identity::RuntimeIdentityTask;
pub use prepare::PrepareTask;
pub use system::SystemPackagesTask;
pub use test_stage::TestStageTask;

use super::types::AssemblyContext;
use assembler_shared::errors::AssemblerError;
use std::sync::Arc;
use tokio::sync::Mutex;

pub type AssemblyCtx = Arc<Mutex<AssemblyContext>>;

/// Log task start and return the build id for later log lines.
pub(super) async fn task_start(ctx: &AssemblyCtx, task_name: &str) -> String {
    let build_id = ctx.lock().await.build_id.clone();
    tracing::debug!(build_id = %build_id, task = task_name, "Task started");
    build_id
}

pub(super) fn log_task_error(build_id: &str, task_name: &str, err: &AssemblerError) {
    tracing::error!(build_id = %build_id, task = task_name, error = %err, "Task failed");
}
