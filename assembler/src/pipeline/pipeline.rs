//! Generic pipeline execution framework.
//!
//! Provides a table-driven pipeline executor that can run stages containing tasks
//! in parallel or sequential mode.

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;
use assembler_shared::errors::{AssemblerError, AssemblerResult};
use futures::future::try_join_all;
use std::time::Instant;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct Pipeline<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> Pipeline<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }
}

pub struct PipelineBuilder;

impl PipelineBuilder {
    pub fn from_plan<Ctx>(plan: ExecutionPlan<Ctx>) -> Pipeline<Ctx> {
        Pipeline::new(plan.stages())
    }
}

/// Pipeline executor framework.
///
/// This provides the generic infrastructure for executing a table-driven pipeline.
/// The actual task execution logic is provided by task implementations.
pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Execute a pipeline.
    ///
    /// Iterates through stages and executes their tasks according to the
    /// stage's execution mode. The first failing task aborts the pipeline;
    /// later stages never start.
    ///
    /// Generic over:
    /// - `Ctx`: Shared pipeline context (use interior mutability for writes)
    pub async fn execute<Ctx>(pipeline: Pipeline<Ctx>, ctx: Ctx) -> AssemblerResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in pipeline.stages.into_iter().enumerate() {
            let execution = stage.execution;
            let name = stage.name;

            if !stage.enabled {
                tracing::debug!(stage = name, "Skipping disabled stage");
                stage_metrics.push(StageMetrics {
                    index,
                    name,
                    execution,
                    skipped: true,
                    duration_ms: 0,
                    tasks: Vec::new(),
                });
                continue;
            }

            tracing::debug!(stage = name, index, ?execution, "Entering stage");
            let stage_start = Instant::now();

            let task_metrics = match execution {
                ExecutionMode::Parallel => {
                    let futures = stage.tasks.into_iter().map(|task| {
                        let ctx = ctx.clone();
                        async move {
                            let name = task.name().to_string();
                            let task_start = Instant::now();
                            task.run(ctx).await?;
                            Ok::<TaskMetrics, AssemblerError>(TaskMetrics {
                                name,
                                duration_ms: task_start.elapsed().as_millis(),
                            })
                        }
                    });
                    try_join_all(futures).await?
                }
                ExecutionMode::Sequential => {
                    let mut task_metrics = Vec::new();
                    for task in stage.tasks {
                        let name = task.name().to_string();
                        let task_start = Instant::now();
                        task.run(ctx.clone()).await?;
                        task_metrics.push(TaskMetrics {
                            name,
                            duration_ms: task_start.elapsed().as_millis(),
                        });
                    }
                    task_metrics
                }
            };

            stage_metrics.push(StageMetrics {
                index,
                name,
                execution,
                skipped: false,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineTask;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record(&'static str);

    #[async_trait]
    impl PipelineTask<Log> for Record {
        async fn run(self: Box<Self>, ctx: Log) -> AssemblerResult<()> {
            ctx.lock().await.push(self.0.to_string());
            Ok(())
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    struct Fail;

    #[async_trait]
    impl PipelineTask<Log> for Fail {
        async fn run(self: Box<Self>, _ctx: Log) -> AssemblerResult<()> {
            Err(AssemblerError::Internal("boom".into()))
        }

        fn name(&self) -> &str {
            "fail"
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_skip_disabled() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let plan = ExecutionPlan::new(vec![
            Stage::sequential("first", vec![Box::new(Record("a")) as BoxedTask<Log>]),
            Stage::sequential("optional", vec![Box::new(Record("b")) as BoxedTask<Log>])
                .enabled(false),
            Stage::parallel(
                "last",
                vec![
                    Box::new(Record("c")) as BoxedTask<Log>,
                    Box::new(Record("d")),
                ],
            ),
        ]);

        let metrics = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone())
            .await
            .unwrap();

        let seen = log.lock().await.clone();
        assert_eq!(seen[0], "a");
        assert!(!seen.contains(&"b".to_string()));
        assert_eq!(seen.len(), 3);
        assert_eq!(metrics.executed_stages(), vec!["first", "last"]);
        assert!(metrics.was_skipped("optional"));
        assert!(metrics.task_duration_ms("c").is_some());
    }

    #[tokio::test]
    async fn test_failure_stops_later_stages() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let plan = ExecutionPlan::new(vec![
            Stage::sequential("broken", vec![Box::new(Fail) as BoxedTask<Log>]),
            Stage::sequential("after", vec![Box::new(Record("never")) as BoxedTask<Log>]),
        ]);

        let result = PipelineExecutor::execute(PipelineBuilder::from_plan(plan), log.clone()).await;

        assert!(result.is_err());
        assert!(log.lock().await.is_empty());
    }
}
