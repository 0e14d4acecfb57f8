//! Error types for the simulator abstraction layer.

use sem_core::SemError;
use thiserror::Error;

/// Errors that can occur while talking to a simulator.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The simulator process could not be started
    #[error("Failed to spawn simulator: {0}")]
    Spawn(String),

    /// Help or globals output did not have the expected shape
    #[error("Unexpected simulator output: {0}")]
    SchemaOutput(String),

    /// The build identity could not be determined
    #[error("Cannot determine build identity: {0}")]
    BuildIdentity(String),

    /// Filesystem error while preparing a run
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnvError {
    /// Creates a spawn error.
    pub fn spawn(msg: impl std::fmt::Display) -> Self {
        Self::Spawn(msg.to_string())
    }

    /// Creates a build identity error.
    pub fn build_identity(msg: impl Into<String>) -> Self {
        Self::BuildIdentity(msg.into())
    }
}

impl From<EnvError> for SemError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::Io(e) => SemError::Io(e),
            other => SemError::runner(other),
        }
    }
}
