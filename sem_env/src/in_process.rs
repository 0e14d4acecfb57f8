//! In-process simulator for deterministic testing.

use crate::error::EnvError;
use crate::simulator::{format_arguments, ParamSchema, Simulator};
use crate::types::ExecutionOutcome;
use async_trait::async_trait;
use parking_lot::Mutex;
use sem_core::{ParamMap, ParamValue};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the closure reports for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,

    /// Extra files written next to stdout/stderr
    pub files: Vec<(String, Vec<u8>)>,
}

impl SimOutput {
    /// A successful run printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// A run failing with `exit_code`.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.push((name.into(), contents.into()));
        self
    }
}

type RunFn = Arc<dyn Fn(&ParamMap, &[(String, String)]) -> SimOutput + Send + Sync>;
type RuntimeFn = Arc<dyn Fn(&ParamMap) -> Duration + Send + Sync>;

/// Simulator whose "executable" is a Rust closure.
///
/// Behaves like [`ProcessSimulator`](crate::ProcessSimulator) from the
/// runner's point of view: output files land in the run directory and the
/// outcome carries the exit code. The optional runtime function makes runs
/// take a parameter-dependent amount of (tokio) time.
pub struct InProcessSimulator {
    script: String,
    schema: ParamSchema,
    commit: Mutex<String>,
    logging: bool,
    components: Vec<String>,
    run: RunFn,
    runtime: Option<RuntimeFn>,

    /// Number of completed `execute` calls
    invocations: AtomicUsize,

    /// Environment of the latest run
    last_env: Mutex<Vec<(String, String)>>,
}

impl InProcessSimulator {
    /// Creates a simulator for `script` that runs `f` for every combination.
    pub fn new<F>(script: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ParamMap, &[(String, String)]) -> SimOutput + Send + Sync + 'static,
    {
        Self {
            script: script.into(),
            schema: ParamSchema::new(),
            commit: Mutex::new("in-process".to_string()),
            logging: false,
            components: Vec::new(),
            run: Arc::new(f),
            runtime: None,
            invocations: AtomicUsize::new(0),
            last_env: Mutex::new(Vec::new()),
        }
    }

    /// Creates an Arc-wrapped simulator for sharing across tasks.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Declares a parameter with an optional default.
    pub fn with_param(mut self, name: impl Into<String>, default: Option<ParamValue>) -> Self {
        self.schema.insert(name.into(), default);
        self
    }

    pub fn with_commit(self, commit: impl Into<String>) -> Self {
        *self.commit.lock() = commit.into();
        self
    }

    /// Enables logging support with the given known components.
    pub fn with_logging<S: Into<String>>(mut self, components: impl IntoIterator<Item = S>) -> Self {
        self.logging = true;
        self.components = components.into_iter().map(Into::into).collect();
        self
    }

    /// Makes each run sleep for `f(params)`.
    pub fn with_runtime<F>(mut self, f: F) -> Self
    where
        F: Fn(&ParamMap) -> Duration + Send + Sync + 'static,
    {
        self.runtime = Some(Arc::new(f));
        self
    }

    /// Changes the build identity, as if the simulator had been rebuilt.
    pub fn set_commit(&self, commit: impl Into<String>) {
        *self.commit.lock() = commit.into();
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    pub fn last_env(&self) -> Vec<(String, String)> {
        self.last_env.lock().clone()
    }
}

#[async_trait]
impl Simulator for InProcessSimulator {
    fn script(&self) -> &str {
        &self.script
    }

    async fn available_parameters(&self) -> Result<ParamSchema, EnvError> {
        Ok(self.schema.clone())
    }

    async fn build_identity(&self) -> Result<String, EnvError> {
        Ok(self.commit.lock().clone())
    }

    fn supports_logging(&self) -> bool {
        self.logging
    }

    async fn available_log_components(&self) -> Result<Vec<String>, EnvError> {
        Ok(self.components.clone())
    }

    async fn execute(
        &self,
        params: &ParamMap,
        workdir: &Path,
        env: &[(String, String)],
    ) -> Result<ExecutionOutcome, EnvError> {
        let start = tokio::time::Instant::now();
        if let Some(runtime) = &self.runtime {
            tokio::time::sleep(runtime(params)).await;
        }

        *self.last_env.lock() = env.to_vec();
        let output = (self.run)(params, env);
        fs::write(workdir.join("stdout"), &output.stdout)?;
        fs::write(workdir.join("stderr"), &output.stderr)?;
        for (name, contents) in &output.files {
            fs::write(workdir.join(name), contents)?;
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);

        Ok(ExecutionOutcome {
            exit_code: output.exit_code,
            elapsed: start.elapsed(),
        })
    }

    fn command_line(&self, params: &ParamMap) -> String {
        let mut parts = vec![self.script.clone()];
        parts.extend(format_arguments(params));
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sem_core::param_map;

    fn echo_simulator() -> InProcessSimulator {
        InProcessSimulator::new("echo", |params, _| {
            let n = params.get("n").and_then(ParamValue::as_i64).unwrap_or(0);
            if n < 0 {
                SimOutput::failed(1, "negative")
            } else {
                SimOutput::ok(format!("{}\n", n * 2)).with_file("data.bin", vec![0u8, 1, 2])
            }
        })
        .with_param("n", Some(ParamValue::Int(1)))
    }

    #[tokio::test]
    async fn test_execute_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let sim = echo_simulator();

        let outcome = sim
            .execute(&param_map([("n", 21)]), dir.path(), &[])
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(fs::read_to_string(dir.path().join("stdout")).unwrap(), "42\n");
        assert_eq!(fs::read_to_string(dir.path().join("stderr")).unwrap(), "");
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), vec![0u8, 1, 2]);
        assert_eq!(sim.invocations(), 1);
    }

    #[tokio::test]
    async fn test_execute_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sim = echo_simulator();
        let outcome = sim
            .execute(&param_map([("n", -1)]), dir.path(), &[])
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_uses_tokio_time() {
        let dir = tempfile::tempdir().unwrap();
        let sim = echo_simulator().with_runtime(|p| {
            Duration::from_secs(p.get("n").and_then(ParamValue::as_i64).unwrap_or(0) as u64)
        });
        let outcome = sim
            .execute(&param_map([("n", 5)]), dir.path(), &[])
            .await
            .unwrap();
        assert!(outcome.elapsed >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_commit_and_env_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let sim = echo_simulator().with_commit("v1");
        assert_eq!(sim.build_identity().await.unwrap(), "v1");
        sim.set_commit("v2");
        assert_eq!(sim.build_identity().await.unwrap(), "v2");

        let env = vec![("NS_LOG".to_string(), "A=level_all".to_string())];
        sim.execute(&param_map([("n", 1)]), dir.path(), &env).await.unwrap();
        assert_eq!(sim.last_env(), env);
        assert_eq!(sim.command_line(&param_map([("n", 1)])), "echo --n=1");
    }
}
