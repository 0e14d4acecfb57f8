//! Production simulator: spawns the compiled script binary.

use crate::error::EnvError;
use crate::schema::{parse_globals_output, parse_help_output, parse_log_component_list};
use crate::simulator::{format_arguments, ParamSchema, Simulator};
use crate::types::{BuildProfile, ExecutionOutcome};
use async_trait::async_trait;
use sem_core::{ParamMap, LOG_ENV_VAR};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;

/// Simulator backed by an executable on disk.
///
/// Every run is a fresh process with the run's directory as its working
/// directory. Standard output and error go straight to files there.
#[derive(Debug, Clone)]
pub struct ProcessSimulator {
    /// Path to the compiled script binary
    executable: PathBuf,

    /// Script name, recorded in the campaign
    script: String,

    /// Command prefix (e.g. a debugger or interpreter)
    launcher: Vec<String>,

    /// Extra environment applied to every invocation
    env: Vec<(String, String)>,

    /// Directory with the simulator's shared libraries
    library_path: Option<PathBuf>,

    /// Build profile of the executable
    profile: BuildProfile,

    /// Git checkout the build came from
    source_root: Option<PathBuf>,

    /// Fixed build identity, bypassing git
    commit: Option<String>,
}

impl ProcessSimulator {
    /// Creates a simulator running `executable` for `script`.
    pub fn new(executable: impl Into<PathBuf>, script: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
            launcher: Vec::new(),
            env: Vec::new(),
            library_path: None,
            profile: BuildProfile::default(),
            source_root: None,
            commit: None,
        }
    }

    /// Creates an Arc-wrapped simulator for sharing across tasks.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn with_profile(mut self, profile: BuildProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_source_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_root = Some(path.into());
        self
    }

    /// Uses `commit` as the build identity instead of asking git.
    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    /// Runs the executable through `launcher`, e.g. `["gdb", "--args"]`.
    pub fn with_launcher<S: Into<String>>(mut self, launcher: impl IntoIterator<Item = S>) -> Self {
        self.launcher = launcher.into_iter().map(Into::into).collect();
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn profile(&self) -> BuildProfile {
        self.profile
    }

    fn command(&self) -> Command {
        let mut cmd = match self.launcher.split_first() {
            Some((program, rest)) => {
                let mut cmd = Command::new(program);
                cmd.args(rest).arg(&self.executable);
                cmd
            }
            None => Command::new(&self.executable),
        };
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(lib) = &self.library_path {
            cmd.env("LD_LIBRARY_PATH", lib);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Runs the executable with `args` and returns stdout and stderr.
    async fn capture(&self, args: &[&str], env: &[(&str, &str)]) -> Result<(String, String), EnvError> {
        let mut cmd = self.command();
        cmd.args(args)
            .envs(env.iter().copied())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = cmd.output().await.map_err(EnvError::spawn)?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }

    fn git_dir(&self) -> PathBuf {
        self.source_root.clone().unwrap_or_else(|| {
            self.executable
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        })
    }

    async fn git(&self, args: &[&str]) -> Result<String, EnvError> {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.git_dir())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EnvError::build_identity(e.to_string()))?;
        if !output.status.success() {
            return Err(EnvError::build_identity(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Exit code of a finished process; signals map to their negated number.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:,+@%".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[async_trait]
impl Simulator for ProcessSimulator {
    fn script(&self) -> &str {
        &self.script
    }

    async fn available_parameters(&self) -> Result<ParamSchema, EnvError> {
        let (help, _) = self.capture(&["--PrintHelp"], &[]).await?;
        let mut schema = parse_help_output(&help);
        if schema.is_empty() && !help.contains("Program Options") && !help.contains("Program Arguments") {
            return Err(EnvError::SchemaOutput(format!(
                "no program options in help output of {}",
                self.executable.display()
            )));
        }
        let (globals, _) = self.capture(&["--PrintGlobals"], &[]).await?;
        for (name, default) in parse_globals_output(&globals) {
            schema.entry(name).or_insert(default);
        }
        tracing::debug!("{} declares {} parameters", self.script, schema.len());
        Ok(schema)
    }

    async fn build_identity(&self) -> Result<String, EnvError> {
        if let Some(commit) = &self.commit {
            return Ok(commit.clone());
        }
        let head = self.git(&["rev-parse", "HEAD"]).await?;
        let status = self.git(&["status", "--porcelain", "--untracked-files=no"]).await?;
        if status.is_empty() {
            Ok(head)
        } else {
            Ok(format!("{}-dirty", head))
        }
    }

    fn supports_logging(&self) -> bool {
        self.profile.supports_logging()
    }

    async fn available_log_components(&self) -> Result<Vec<String>, EnvError> {
        let (stdout, stderr) = self.capture(&[], &[(LOG_ENV_VAR, "print-list")]).await?;
        let mut components = parse_log_component_list(&stdout);
        components.extend(parse_log_component_list(&stderr));
        components.sort();
        components.dedup();
        Ok(components)
    }

    async fn execute(
        &self,
        params: &ParamMap,
        workdir: &Path,
        env: &[(String, String)],
    ) -> Result<ExecutionOutcome, EnvError> {
        let stdout = File::create(workdir.join("stdout"))?;
        let stderr = File::create(workdir.join("stderr"))?;

        let mut cmd = self.command();
        cmd.args(format_arguments(params))
            .envs(env.iter().map(|(k, v)| (k, v)))
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let start = Instant::now();
        let status = cmd.status().await.map_err(EnvError::spawn)?;
        let outcome = ExecutionOutcome {
            exit_code: exit_code(status),
            elapsed: start.elapsed(),
        };
        tracing::trace!("{} exited with {} in {:?}", self.script, outcome.exit_code, outcome.elapsed);
        Ok(outcome)
    }

    fn command_line(&self, params: &ParamMap) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(lib) = &self.library_path {
            parts.push(format!("LD_LIBRARY_PATH={}", shell_quote(&lib.to_string_lossy())));
        }
        parts.extend(self.launcher.iter().map(|s| shell_quote(s)));
        parts.push(shell_quote(&self.executable.to_string_lossy()));
        parts.extend(format_arguments(params).iter().map(|s| shell_quote(s)));
        parts.join(" ")
    }
}
