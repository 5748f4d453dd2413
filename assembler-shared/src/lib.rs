//! Types shared between the assembler library and its command-line front end.

pub mod errors;

pub use errors::{AssemblerError, AssemblerResult};
