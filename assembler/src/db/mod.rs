//! Build history persistence.
//!
//! One SQLite file under the state directory with a row per completed
//! build. The digests used by reproducibility checks are real columns; the
//! full record rides along as JSON.

mod builds;
mod migrations;

pub use builds::{BuildRecord, BuildStore};
pub use migrations::SCHEMA_VERSION;

/// Convert rusqlite errors to `AssemblerError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| assembler_shared::errors::AssemblerError::Database(e.to_string()))
    };
}

pub(crate) use db_err;
