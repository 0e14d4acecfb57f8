//! Runner selection.

use super::{LptRunner, ParallelRunner, Runner, SequentialRunner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Available scheduling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// One simulation at a time
    Sequential,

    /// Worker pool, completion order
    #[default]
    Parallel,

    /// Worker pool, longest expected runs first
    Lpt,
}

impl RunnerKind {
    pub fn all() -> Vec<RunnerKind> {
        vec![RunnerKind::Sequential, RunnerKind::Parallel, RunnerKind::Lpt]
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunnerKind::Sequential => "sequential",
            RunnerKind::Parallel => "parallel",
            RunnerKind::Lpt => "lpt",
        }
    }

    pub fn build(&self) -> Arc<dyn Runner> {
        match self {
            RunnerKind::Sequential => Arc::new(SequentialRunner::new()),
            RunnerKind::Parallel => Arc::new(ParallelRunner::new()),
            RunnerKind::Lpt => Arc::new(LptRunner::new()),
        }
    }
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" | "simulationrunner" => Ok(RunnerKind::Sequential),
            "parallel" | "parallelrunner" => Ok(RunnerKind::Parallel),
            "lpt" | "lptrunner" => Ok(RunnerKind::Lpt),
            _ => Err(format!("Unknown runner: {}", s)),
        }
    }
}
