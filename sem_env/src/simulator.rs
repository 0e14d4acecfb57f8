//! The simulator as seen by runners.

use crate::error::EnvError;
use crate::types::ExecutionOutcome;
use async_trait::async_trait;
use indexmap::IndexMap;
use sem_core::{ParamMap, ParamValue};
use std::path::Path;

/// Parameter schema: declared names and their defaults.
pub type ParamSchema = IndexMap<String, Option<ParamValue>>;

/// Abstraction over the simulator executable.
///
/// # Implementations
///
/// - **Production**: [`ProcessSimulator`](crate::ProcessSimulator) spawns the
///   compiled binary with `tokio::process`
/// - **Testing**: [`InProcessSimulator`](crate::InProcessSimulator) runs a
///   closure in place of the binary
///
/// # Run Flow
///
/// ```text
/// Runner                          Simulator
///   |                                 |
///   |-- mkdir data/<id>/              |
///   |-- execute(params, dir, env) --->|
///   |                                 |-- writes stdout, stderr, ...
///   |<-- ExecutionOutcome ------------|
/// ```
#[async_trait]
pub trait Simulator: Send + Sync + 'static {
    /// Name of the simulation script this simulator runs.
    fn script(&self) -> &str;

    /// Discovers the parameters the script accepts, with their defaults.
    async fn available_parameters(&self) -> Result<ParamSchema, EnvError>;

    /// Opaque token identifying the build. Equal tokens mean equal builds.
    async fn build_identity(&self) -> Result<String, EnvError>;

    /// Whether the build emits log output when asked to.
    fn supports_logging(&self) -> bool;

    /// Log components known to the build.
    async fn available_log_components(&self) -> Result<Vec<String>, EnvError>;

    /// Runs one combination.
    ///
    /// # Arguments
    /// * `params` - Passed as `--name=value`, in order
    /// * `workdir` - Existing directory used as the working directory;
    ///   `stdout` and `stderr` are written here
    /// * `env` - Extra environment variables for this run only
    ///
    /// # Returns
    /// The exit code and elapsed time. A non-zero exit is not an error here.
    async fn execute(
        &self,
        params: &ParamMap,
        workdir: &Path,
        env: &[(String, String)],
    ) -> Result<ExecutionOutcome, EnvError>;

    /// Shell command that reproduces a run of `params`.
    fn command_line(&self, params: &ParamMap) -> String;
}

/// Formats a combination as `--name=value` arguments.
pub fn format_arguments(params: &ParamMap) -> Vec<String> {
    params.iter().map(|(k, v)| format!("--{}={}", k, v)).collect()
}
