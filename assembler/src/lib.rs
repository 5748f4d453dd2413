//! Multi-stage, least-privilege container image assembly for Python
//! applications.
//!
//! A build reads the project manifest and lockfile, plans the stages
//! (single-stage, or builder + final when native extensions need a
//! toolchain), installs dependencies into a relocatable venv, and writes an
//! OCI image layout whose default user is a non-root runtime identity.
//!
//! ```ignore
//! let options = AssemblerOptions::discover(Path::new("."))?;
//! let state = StateLayout::for_project(&options.project.root);
//! let assembler = Assembler::new(options, state)?;
//! let output = assembler.build(Path::new("dist/image")).await?;
//! ```

pub mod assemble;
pub mod db;
pub mod deps;
pub mod image;
pub mod installer;
pub mod pipeline;
pub mod planner;
pub mod runtime;
pub mod verify;

pub use assemble::{AssemblyOutput, ImageBuilder};
pub use assembler_shared::errors::{AssemblerError, AssemblerResult};
pub use planner::{BuildMode, BuildPlan, OwnershipPolicy, PlanMode};
pub use runtime::{Assembler, AssemblerOptions, StateLayout};
pub use verify::{StartupProbe, VerifyReport};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_PREFIX: &str = "assembler.log";

/// Install the global subscriber: stderr plus a daily-rotated file under
/// `logs_dir`. `RUST_LOG` wins over `default_level`.
///
/// Keep the returned guard alive; dropping it flushes and stops the file
/// writer.
pub fn init_logging(logs_dir: &Path, default_level: &str) -> AssemblerResult<WorkerGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        AssemblerError::Storage(format!(
            "Failed to create log directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .map_err(|e| AssemblerError::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}
