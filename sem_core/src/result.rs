//! Campaign configuration and result records.

use crate::params::{ParamMap, ParamValue};
use crate::severity::LogComponents;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration row of a campaign, written once at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    /// Simulator entry-point name
    pub script: String,

    /// Identity token of the simulator build
    pub commit: String,

    /// Recognized parameters and their defaults (`None` = no default)
    pub params: IndexMap<String, Option<ParamValue>>,
}

impl CampaignConfig {
    pub fn new(
        script: impl Into<String>,
        commit: impl Into<String>,
        params: IndexMap<String, Option<ParamValue>>,
    ) -> Self {
        Self {
            script: script.into(),
            commit: commit.into(),
            params,
        }
    }

    /// Parameter names declared by the script.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
}

/// Execution metadata attached to every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultMeta {
    /// Unique id, also the name of the result's output directory
    pub id: String,

    /// Wall-clock duration of the run in seconds
    pub elapsed_time: f64,

    /// Process exit code
    pub exitcode: i32,

    /// Logging enabled for this run, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_components: Option<LogComponents>,
}

/// One simulation run: the parameters used and how it went.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationResult {
    pub params: ParamMap,
    pub meta: ResultMeta,
}

impl SimulationResult {
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn succeeded(&self) -> bool {
        self.meta.exitcode == 0
    }
}

impl fmt::Display for SimulationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(
            f,
            "{} [{}] exit={} elapsed={:.3}s",
            self.meta.id,
            params.join(", "),
            self.meta.exitcode,
            self.meta.elapsed_time
        )
    }
}

/// Content of one output file.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFile {
    /// File decoded as UTF-8 text
    Text(String),

    /// File that is not valid text; raw bytes are kept
    Raw(Vec<u8>),
}

impl OutputFile {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutputFile::Text(s) => Some(s),
            OutputFile::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, OutputFile::Raw(_))
    }
}

/// A result together with the contents of its output files.
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteResult {
    pub result: SimulationResult,

    /// File name to contents, sorted by name
    pub output: IndexMap<String, OutputFile>,
}

impl CompleteResult {
    pub fn params(&self) -> &ParamMap {
        &self.result.params
    }

    pub fn meta(&self) -> &ResultMeta {
        &self.result.meta
    }

    /// Text of the `stdout` file, empty when missing or undecodable.
    pub fn stdout(&self) -> &str {
        self.output.get("stdout").and_then(OutputFile::as_text).unwrap_or("")
    }

    pub fn stderr(&self) -> &str {
        self.output.get("stderr").and_then(OutputFile::as_text).unwrap_or("")
    }
}
