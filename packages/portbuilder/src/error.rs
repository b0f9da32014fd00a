//! Structured error types for each subsystem.
//!
//! Leaf subsystems return one of these enums so callers can match on a
//! specific failure mode; orchestration code composes them with
//! [`color_eyre::Result`] via `?` and `.context(...)`.

use thiserror::Error;

/// Errors raised while parsing a user-supplied port specification or
/// resolving its metadata.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid port specification: {spec:?}")]
    InvalidSpec { spec: String },

    #[error("port not found: {spec} (expected at {path})")]
    PortNotFound { spec: String, path: String },

    #[error("failed to query metadata for {origin}: {detail}")]
    MetadataError { origin: String, detail: String },

    #[error("no environment backend registered under {name:?}")]
    UnknownBackend { name: String },
}

/// Errors raised by the topological scheduler.
#[derive(Debug, Error)]
#[error("dependency cycle involving {total} package(s), e.g. {sample_origins:?}")]
pub struct CycleError {
    pub total: usize,
    pub sample_origins: Vec<String>,
}

/// Errors raised while computing a port's content fingerprint.
#[derive(Debug, Error)]
#[error("failed to fingerprint {path}: {cause}")]
pub struct FingerprintError {
    pub path: String,
    pub cause: String,
}

/// Errors raised by the embedded build store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt stored record: {0}")]
    Record(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors raised while managing a worker's isolated build sandbox.
#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("failed to set up sandbox ({op}): {cause}")]
    Setup { op: String, cause: String },

    #[error("failed to execute command ({op}): {cause}")]
    Execution { op: String, cause: String },

    #[error("failed to tear down sandbox, {unreleased} mount(s) remain: {mounts:?}")]
    Cleanup {
        unreleased: usize,
        mounts: Vec<String>,
    },
}

/// Why a phase execution did not complete with an exit code.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    #[error("execution was cancelled")]
    Cancelled,

    #[error("execution exceeded its configured timeout")]
    TimedOut,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cycle_error_formats_sample() {
        let err = CycleError {
            total: 2,
            sample_origins: vec!["a/b".to_string(), "c/d".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle involving 2 package(s), e.g. [\"a/b\", \"c/d\"]"
        );
    }
}
