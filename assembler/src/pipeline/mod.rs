//! Stage/task executor shared by every build mode.
//!
//! A build is a list of named stages run in order. Each stage holds tasks
//! that run either one after another or concurrently; a stage can be
//! switched off and still show up (as skipped) in the metrics.
//!
//! ```text
//! ExecutionPlan ── Stage "prepare"  [sequential]  PrepareTask
//!               ── Stage "system"   [parallel]    builder ║ final
//!               ── Stage "test"     [disabled]    TestStageTask
//!               ── ...
//! ```
//!
//! ```ignore
//! let plan = ExecutionPlan::new(vec![
//!     Stage::parallel("system", vec![Box::new(TaskA), Box::new(TaskB)]),
//!     Stage::sequential("test", vec![Box::new(TaskC)]).enabled(run_tests),
//! ]);
//! let metrics = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), ctx).await?;
//! assert!(metrics.was_skipped("test") != run_tests);
//! ```

mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod stage;
mod task;

pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use pipeline::{ExecutionPlan, Pipeline, PipelineBuilder, PipelineExecutor};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
