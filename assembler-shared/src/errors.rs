//! Error taxonomy for image assembly.
//!
//! Every variant is terminal for the build attempt that produced it. Nothing
//! is recovered locally and no partial artifact is left behind.

use thiserror::Error;

pub type AssemblerResult<T> = Result<T, AssemblerError>;

#[derive(Debug, Error)]
pub enum AssemblerError {
    /// Invalid or inconsistent assembler options.
    #[error("configuration error: {0}")]
    Config(String),

    /// Manifest or lockfile could not be read or parsed.
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Lockfile does not satisfy the manifest, the package index is
    /// unreachable, or a pinned version is unavailable.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// A native dependency could not be built in the builder domain.
    #[error("native build failed for {package}: {reason}")]
    NativeBuild { package: String, reason: String },

    /// The package installer failed for a reason other than resolution.
    #[error("install failed: {0}")]
    Install(String),

    /// The stage plan is malformed.
    #[error("invalid build plan: {0}")]
    Plan(String),

    /// A step requiring privilege is ordered after the switch to the
    /// runtime identity.
    #[error("stage '{stage}': step '{step}' requires privilege but runs after USER")]
    PlanOrder { stage: String, step: String },

    /// The final domain carries build-only packages.
    #[error("isolation violated: final stage contains toolchain package(s): {0}")]
    Isolation(String),

    /// The optional test stage ran and failed.
    #[error("test stage failed: {0}")]
    TestFailure(String),

    /// The image requires a shared library the final domain does not ship.
    #[error("{package} requires runtime library '{library}' missing from the final image")]
    MissingRuntimeLibrary { package: String, library: String },

    /// The runtime identity cannot access a path in the image.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Image layout, layer or OCI descriptor error.
    #[error("image error: {0}")]
    Image(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AssemblerError {
    /// Whether the error happened while resolving or installing dependencies,
    /// i.e. before the final stage could begin.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            AssemblerError::Manifest(_)
                | AssemblerError::Resolution(_)
                | AssemblerError::NativeBuild { .. }
                | AssemblerError::Install(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_build_message() {
        let err = AssemblerError::NativeBuild {
            package: "psycopg2".into(),
            reason: "missing libpq-dev".into(),
        };
        assert_eq!(
            err.to_string(),
            "native build failed for psycopg2: missing libpq-dev"
        );
        assert!(err.is_dependency_failure());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: AssemblerError = io.into();
        assert!(matches!(err, AssemblerError::Io(_)));
        assert!(!err.is_dependency_failure());
    }
}
