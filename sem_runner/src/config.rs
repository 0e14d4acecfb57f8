//! Runner configuration.

use sem_core::SemResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs shared by every runner and the campaign manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum concurrent simulations (None = logical CPU count)
    pub max_workers: Option<usize>,

    /// Abort the batch after the first non-zero exit
    pub stop_on_errors: bool,

    /// Refuse to run when the simulator build differs from the campaign's
    pub check_commit: bool,

    /// Seconds between catalog flushes during a batch
    pub flush_interval_secs: u64,

    /// Shuffle work lists before dispatch (ignored by LPT)
    pub shuffle: bool,

    /// Seed for LPT tie-breaking (None = OS entropy)
    pub lpt_seed: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            stop_on_errors: false,
            check_commit: true,
            flush_interval_secs: 60,
            shuffle: true,
            lpt_seed: None,
        }
    }
}

impl RunnerConfig {
    /// Loads a JSON config file; absent keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> SemResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Number of workers to start.
    pub fn workers(&self) -> usize {
        self.max_workers
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = Some(workers);
        self
    }

    pub fn with_stop_on_errors(mut self, stop: bool) -> Self {
        self.stop_on_errors = stop;
        self
    }

    pub fn with_check_commit(mut self, check: bool) -> Self {
        self.check_commit = check;
        self
    }

    pub fn with_flush_interval(mut self, secs: u64) -> Self {
        self.flush_interval_secs = secs;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_lpt_seed(mut self, seed: u64) -> Self {
        self.lpt_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert!(config.check_commit);
        assert!(!config.stop_on_errors);
        assert!(config.workers() >= 1);
        assert_eq!(config.with_max_workers(0).workers(), 1);
    }

    #[test]
    fn test_from_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, r#"{"max_workers": 3, "stop_on_errors": true}"#).unwrap();

        let config = RunnerConfig::from_file(&path).unwrap();
        assert_eq!(config.workers(), 3);
        assert!(config.stop_on_errors);
        assert_eq!(config.flush_interval_secs, 60);
        assert!(config.shuffle);
    }

    #[test]
    fn test_from_file_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(RunnerConfig::from_file(&path).is_err());
    }
}
