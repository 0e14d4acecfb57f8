//! Shared types for simulator implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What a single simulator invocation produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionOutcome {
    /// Process exit code (negative signal number if killed by a signal)
    pub exit_code: i32,

    /// Wall-clock time between spawn and exit
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How the simulator was built.
///
/// Only debug builds keep the logging macros compiled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    #[default]
    Optimized,
    Debug,
}

impl BuildProfile {
    pub fn supports_logging(&self) -> bool {
        matches!(self, BuildProfile::Debug)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildProfile::Optimized => "optimized",
            BuildProfile::Debug => "debug",
        }
    }
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for BuildProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "optimized" | "release" => Ok(BuildProfile::Optimized),
            "debug" => Ok(BuildProfile::Debug),
            _ => Err(format!("Unknown build profile: {}", s)),
        }
    }
}
