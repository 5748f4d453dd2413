//! Stage definition for table-driven pipeline execution.

/// Execution mode for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Execute tasks concurrently via `try_join_all`
    Parallel,
    /// Execute tasks sequentially, one after another
    Sequential,
}

/// A named stage containing tasks and an execution mode.
///
/// Stages are executed in order, and each stage's tasks are executed
/// according to the stage's execution mode (parallel or sequential).
/// A disabled stage stays in the plan and is reported as skipped.
///
/// Generic over task type T to allow different pipeline implementations.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub name: &'static str,
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
    pub enabled: bool,
}

impl<T> Stage<T> {
    /// Create a stage with parallel task execution.
    pub fn parallel(name: &'static str, tasks: Vec<T>) -> Self {
        Self {
            name,
            tasks,
            execution: ExecutionMode::Parallel,
            enabled: true,
        }
    }

    /// Create a stage with sequential task execution.
    pub fn sequential(name: &'static str, tasks: Vec<T>) -> Self {
        Self {
            name,
            tasks,
            execution: ExecutionMode::Sequential,
            enabled: true,
        }
    }

    /// Gate the stage on a flag. Disabled stages are skipped by the executor.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_defaults_to_enabled() {
        let stage: Stage<u8> = Stage::sequential("install", vec![1, 2]);
        assert!(stage.enabled);
        assert_eq!(stage.execution, ExecutionMode::Sequential);

        let stage = stage.enabled(false);
        assert!(!stage.enabled);
        assert_eq!(stage.name, "install");
    }
}
