//! Image assembly orchestration.
//!
//! ## Architecture
//!
//! Assembly is table-driven, with the execution plan chosen by build mode:
//!
//! ```text
//! TwoStage:
//!   1. Prepare                  (work dir, builder + final stage roots)
//!   2. BuilderSystem ─┬─        (toolchain + headers into builder)
//!      FinalSystem   ─┘         (runtime libraries into final)
//!   3. DependencyInstall ─┬─    (venv artifact in builder)
//!      RuntimeIdentity   ─┘     (non-root user in final)
//!   4. TestStage                (optional: dev venv + test command)
//!   5. RuntimeCopy              (barrier: venv + source layers)
//!   6. ImageExport              (system layer, env, OCI layout)
//!
//! SingleStage:
//!   1. Prepare
//!   2. FinalSystem              (toolchain, headers and runtime libraries)
//!   3. RuntimeIdentity
//!   4. DependencyInstall
//!   5. TestStage                (optional)
//!   6. RuntimeCopy
//!   7. ImageExport
//! ```
//!
//! `CleanupGuard` removes scratch and staging state; the output directory
//! only changes after every stage succeeded.

mod tasks;
mod types;

pub use tasks::AssemblyCtx;
pub use types::{
    AssemblyContext, AssemblyInputs, CleanupGuard, CommandTestRunner, ExportOutput, StageRoots,
    TestRunner,
};

use crate::image::WrittenImage;
use crate::installer::InstallReport;
use crate::pipeline::{
    BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, PipelineMetrics, Stage,
};
use crate::planner::{BuildMode, BuildPlan};
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use tasks::{
    DependencyInstallTask, ImageExportTask, PrepareTask, RuntimeCopyTask, RuntimeIdentityTask,
    SystemPackagesTask, TestStageTask,
};

pub const TEST_PIPELINE_STAGE: &str = "test";

// ============================================================================
// EXECUTION PLAN
// ============================================================================

/// Get execution plan based on build mode.
pub(crate) fn get_execution_plan(mode: BuildMode, run_tests: bool) -> ExecutionPlan<AssemblyCtx> {
    let mut stages: Vec<Stage<BoxedTask<AssemblyCtx>>> =
        vec![Stage::sequential("prepare", vec![Box::new(PrepareTask)])];

    match mode {
        BuildMode::TwoStage => {
            // Builder and final domains are independent until the copy
            stages.push(Stage::parallel(
                "system",
                vec![
                    Box::new(SystemPackagesTask::builder()),
                    Box::new(SystemPackagesTask::final_stage()),
                ],
            ));
            stages.push(Stage::parallel(
                "dependencies",
                vec![Box::new(DependencyInstallTask), Box::new(RuntimeIdentityTask)],
            ));
        }
        BuildMode::SingleStage => {
            stages.push(Stage::sequential(
                "system",
                vec![Box::new(SystemPackagesTask::final_stage())],
            ));
            stages.push(Stage::sequential(
                "identity",
                vec![Box::new(RuntimeIdentityTask)],
            ));
            stages.push(Stage::sequential(
                "dependencies",
                vec![Box::new(DependencyInstallTask)],
            ));
        }
    }

    let test_stage: Stage<BoxedTask<AssemblyCtx>> =
        Stage::sequential(TEST_PIPELINE_STAGE, vec![Box::new(TestStageTask)]);
    stages.push(test_stage.enabled(run_tests));
    stages.push(Stage::sequential("copy", vec![Box::new(RuntimeCopyTask)]));
    stages.push(Stage::sequential("export", vec![Box::new(ImageExportTask)]));

    ExecutionPlan::new(stages)
}

/// Result of a successful assembly.
#[derive(Debug, Clone)]
pub struct AssemblyOutput {
    pub build_id: String,
    pub plan: BuildPlan,
    pub install: InstallReport,
    pub image: WrittenImage,
    pub output: PathBuf,
    pub tests_ran: bool,
    pub metrics: PipelineMetrics,
    pub total_duration_ms: u128,
}

/// Runs the assembly pipeline for one build.
///
/// # Example
///
/// ```ignore
/// let output = ImageBuilder::new(inputs)?.build().await?;
/// println!("{}", output.image.manifest_digest);
/// ```
pub struct ImageBuilder {
    inputs: AssemblyInputs,
}

impl ImageBuilder {
    pub fn new(inputs: AssemblyInputs) -> AssemblerResult<Self> {
        inputs.options.sanitize()?;
        inputs.plan.validate()?;
        Ok(Self { inputs })
    }

    /// Execute all assembly stages with cleanup on failure.
    pub async fn build(self) -> AssemblerResult<AssemblyOutput> {
        let total_start = Instant::now();
        let mode = self.inputs.plan.mode;
        let run_tests = self.inputs.plan.has_test_stage();
        let build_id = self.inputs.build_id.clone();

        tracing::info!(build_id = %build_id, %mode, run_tests, "Starting assembly");

        let ctx = Arc::new(Mutex::new(AssemblyContext::new(self.inputs)));
        let plan = get_execution_plan(mode, run_tests);
        let pipeline = PipelineBuilder::from_plan(plan);
        let metrics = PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await?;

        let mut ctx = ctx.lock().await;
        let install = ctx
            .install_output
            .take()
            .ok_or_else(|| AssemblerError::Internal("dependency install task must run first".into()))?;
        let export = ctx
            .export_output
            .take()
            .ok_or_else(|| AssemblerError::Internal("image export task must run first".into()))?;
        let tests_ran = ctx.test_output.is_some();

        ctx.guard.disarm();

        let total_duration_ms = total_start.elapsed().as_millis();
        for stage in &metrics.stages {
            tracing::debug!(
                build_id = %build_id,
                stage = stage.name,
                skipped = stage.skipped,
                duration_ms = stage.duration_ms as u64,
                "Stage timing"
            );
        }
        tracing::info!(
            build_id = %build_id,
            duration_ms = total_duration_ms as u64,
            image = %export.image.manifest_digest,
            "Assembly complete"
        );

        Ok(AssemblyOutput {
            build_id,
            plan: ctx.plan.clone(),
            install,
            image: export.image,
            output: export.output,
            tests_ran,
            metrics,
            total_duration_ms,
        })
    }
}
