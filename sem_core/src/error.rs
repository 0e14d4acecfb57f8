//! Error types for the Simulation Execution Manager.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by campaign, expansion, log and execution operations.
#[derive(Debug, Error)]
pub enum SemError {
    /// Parameter spec has a cyclic or dangling functional reference
    #[error("Bad parameter spec: {0}")]
    BadSpec(String),

    /// Campaign directory exists and overwrite was not requested
    #[error("Campaign already exists at {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Overwrite refused because the directory holds files the store does not own
    #[error("Refusing to overwrite {}: it contains user data ({1})", .0.display())]
    UserDataPresent(PathBuf, String),

    /// Catalog config row missing or structurally unexpected
    #[error("Corrupt campaign catalog: {0}")]
    Corrupt(String),

    /// Inserted result does not match the canonical template
    #[error("Result has an unexpected structure: {0}")]
    BadStructure(String),

    /// Query or combination references a parameter the campaign does not know
    #[error("Unknown parameter: {0}")]
    UnknownParam(String),

    /// Combination lacks a parameter that has no default value
    #[error("Missing value for parameter without default: {0}")]
    MissingParam(String),

    /// Array projection demands results that are absent
    #[error("Incomplete coverage: {0}")]
    IncompleteCoverage(String),

    /// Simulator build identity differs from the stored commit
    #[error("Commit mismatch: campaign was created with {expected}, simulator is at {found}")]
    CommitMismatch { expected: String, found: String },

    /// Campaigns with different configs cannot be merged
    #[error("Campaign configs differ: {0}")]
    ConfigMismatch(String),

    /// A simulation exited non-zero while `stop_on_errors` was set
    #[error("Simulation {id} failed with exit code {exitcode}")]
    SimulationFailed { id: String, exitcode: i32 },

    /// Logging requested against a simulator built without it
    #[error("Logging unsupported: {0}")]
    LoggingUnsupported(String),

    /// Log components referenced an unknown component or severity token
    #[error("Invalid log components: {0}")]
    InvalidLogComponents(String),

    /// Log filter received an argument of the wrong shape
    #[error("Bad log filter: {0}")]
    BadFilter(String),

    /// A path argument was not absolute
    #[error("Path must be absolute: {}", .0.display())]
    RelativePath(PathBuf),

    /// Lookup by id found nothing
    #[error("No results: {0}")]
    NoResults(String),

    /// Runner or simulator plumbing failed
    #[error("Runner error: {0}")]
    Runner(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SemError {
    /// Creates a bad spec error.
    pub fn bad_spec(msg: impl Into<String>) -> Self {
        Self::BadSpec(msg.into())
    }

    /// Creates a corrupt catalog error.
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Creates a bad structure error.
    pub fn bad_structure(msg: impl Into<String>) -> Self {
        Self::BadStructure(msg.into())
    }

    /// Creates a bad filter error.
    pub fn bad_filter(msg: impl Into<String>) -> Self {
        Self::BadFilter(msg.into())
    }

    /// Creates a runner error.
    pub fn runner(msg: impl std::fmt::Display) -> Self {
        Self::Runner(msg.to_string())
    }
}

/// Convenience alias used across the workspace.
pub type SemResult<T> = Result<T, SemError>;

/// Ensures a path argument is absolute.
pub fn require_absolute(path: &std::path::Path) -> SemResult<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(SemError::RelativePath(path.to_path_buf()))
    }
}
