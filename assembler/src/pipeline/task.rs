use assembler_shared::errors::AssemblerResult;
use async_trait::async_trait;

/// One unit of work inside a stage.
///
/// Each task receives its own clone of the context; for the assembly
/// pipeline that is an `Arc<Mutex<_>>`, so writes are shared.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> AssemblerResult<()>;

    /// Stable name used in logs and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
