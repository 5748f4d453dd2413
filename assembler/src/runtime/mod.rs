//! Options, on-disk state and the `Assembler` facade.

mod assembler;
mod layout;
mod options;

pub use assembler::{Assembler, ResolvedProject};
pub use layout::{DB_FILE, STATE_DIR, StateLayout, staging_path};
pub use options::{
    AssemblerOptions, CONFIG_FILE, ImageOptions, InstallerKind, PipelineOptions, ProjectOptions,
    ToolchainOptions,
};
