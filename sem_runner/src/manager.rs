//! Campaign manager: the façade that owns a store and a runner.
//!
//! ```text
//!  ParamSpec ──expand──▶ combinations ──minus stored──▶ jobs (+ fresh RngRun)
//!                                                          │
//!                                          Runner ◀────────┘
//!                                            │ completion order
//!                                            ▼
//!                                     CampaignStore ──▶ arrays / frames / folders
//! ```

use crate::config::RunnerConfig;
use crate::observer::{Observers, RunObserver};
use crate::runner::{run_single, ConditionalRunner, Job, RunContext, Runner, RunnerKind, StopCondition};
use crate::views::{ParsedValues, ResultArray, ResultFrame};
use rand::seq::SliceRandom;
use sem_core::{
    combination_key, process_logs, require_absolute, CampaignConfig, CampaignStore, CompleteResult,
    LogComponents, LogStore, LogSummary, ParamMap, ParamSpec, ParamValue, ResultQuery, SemError,
    SemResult, SimulationResult, SpecValue, RNGRUN,
};
use sem_env::Simulator;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Convergence test evaluated against the store.
pub type StoreCondition = Arc<dyn Fn(&CampaignStore, &ParamMap) -> bool + Send + Sync>;

/// How many runs [`CampaignManager::run_missing_simulations`] should ensure.
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Runs per combination (ignored when the spec fixes `RngRun`)
    pub runs: Option<usize>,

    /// Run until this holds for every combination instead of a fixed count
    pub condition: Option<StoreCondition>,

    /// Logging to enable for every launched run
    pub log_components: Option<LogComponents>,
}

impl RunOptions {
    pub fn runs(runs: usize) -> Self {
        Self {
            runs: Some(runs),
            ..Self::default()
        }
    }

    pub fn until<F>(condition: F) -> Self
    where
        F: Fn(&CampaignStore, &ParamMap) -> bool + Send + Sync + 'static,
    {
        Self {
            condition: Some(Arc::new(condition)),
            ..Self::default()
        }
    }

    pub fn with_log_components(mut self, log_components: LogComponents) -> Self {
        self.log_components = Some(log_components);
        self
    }
}

/// What a batch did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub results_inserted: usize,

    /// `stderr` of every run launched with logging enabled
    pub log_files: Vec<PathBuf>,
}

/// Owns a campaign store and decides what to run.
pub struct CampaignManager {
    store: Arc<CampaignStore>,
    simulator: Arc<dyn Simulator>,
    runner: RunnerKind,
    config: RunnerConfig,
    observers: Observers,
}

impl CampaignManager {
    /// Opens the campaign at `dir` for `simulator`, creating it if needed.
    ///
    /// An existing campaign for the same script and parameters is reloaded
    /// unless `overwrite` is set. Any other existing content is refused.
    pub async fn new(
        dir: impl AsRef<Path>,
        simulator: Arc<dyn Simulator>,
        overwrite: bool,
    ) -> SemResult<Self> {
        let dir = dir.as_ref();
        require_absolute(dir)?;
        let params = simulator.available_parameters().await?;
        let commit = simulator.build_identity().await?;
        let config = CampaignConfig::new(simulator.script(), commit, params);

        if !overwrite && dir.exists() {
            match CampaignStore::load(dir) {
                Ok(store) if store.script() == config.script && store.params() == &config.params => {
                    info!("Reloading campaign at {} ({} results)", dir.display(), store.len());
                    return Ok(Self::from_store(store, simulator));
                }
                Ok(_) => return Err(SemError::AlreadyExists(dir.to_path_buf())),
                Err(SemError::Corrupt(reason)) => debug!("No usable catalog at {}: {}", dir.display(), reason),
                Err(e) => return Err(e),
            }
        }

        let store = CampaignStore::create(dir, config, overwrite)?;
        Ok(Self::from_store(store, simulator))
    }

    /// Loads an existing campaign without comparing its schema.
    pub fn load(dir: impl AsRef<Path>, simulator: Arc<dyn Simulator>) -> SemResult<Self> {
        Ok(Self::from_store(CampaignStore::load(dir)?, simulator))
    }

    pub fn from_store(store: CampaignStore, simulator: Arc<dyn Simulator>) -> Self {
        Self {
            store: Arc::new(store),
            simulator,
            runner: RunnerKind::default(),
            config: RunnerConfig::default(),
            observers: Observers::new(),
        }
    }

    pub fn with_runner(mut self, runner: RunnerKind) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn store(&self) -> &CampaignStore {
        &self.store
    }

    pub fn simulator(&self) -> &Arc<dyn Simulator> {
        &self.simulator
    }

    pub fn runner_kind(&self) -> RunnerKind {
        self.runner
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------------

    /// Fails when the simulator build differs from the campaign's commit,
    /// unless commit checking is disabled.
    pub async fn check_commit(&self) -> SemResult<()> {
        if !self.config.check_commit {
            return Ok(());
        }
        let found = self.simulator.build_identity().await?;
        if found != self.store.commit() {
            return Err(SemError::CommitMismatch {
                expected: self.store.commit().to_string(),
                found,
            });
        }
        Ok(())
    }

    /// Completes `spec` with the campaign's defaults.
    ///
    /// Keys the campaign does not declare fail with `UnknownParam`; declared
    /// parameters without a default that `spec` leaves out fail with
    /// `MissingParam`.
    pub fn fill_defaults(&self, spec: &ParamSpec) -> SemResult<ParamSpec> {
        let declared = self.store.params();
        if let Some(unknown) = spec.keys().find(|k| *k != RNGRUN && !declared.contains_key(*k)) {
            return Err(SemError::UnknownParam(unknown.to_string()));
        }
        let mut filled = spec.clone();
        for (name, default) in declared {
            if filled.contains_key(name) {
                continue;
            }
            match default {
                Some(value) => filled.insert(name.clone(), SpecValue::Scalar(value.clone())),
                None => return Err(SemError::MissingParam(name.clone())),
            }
        }
        Ok(filled)
    }

    /// Parses `(component, specifier)` pairs against the simulator's
    /// available components, so `*` can be expanded.
    pub async fn log_components<K, V, I>(&self, pairs: I) -> SemResult<LogComponents>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let known = self.simulator.available_log_components().await?;
        LogComponents::parse(pairs, Some(&known))
    }

    // ------------------------------------------------------------------------
    // Running
    // ------------------------------------------------------------------------

    /// Stored results equivalent to `params` with exactly these log components.
    fn stored_matches(
        &self,
        params: &ParamMap,
        log_components: Option<&LogComponents>,
    ) -> SemResult<Vec<SimulationResult>> {
        let mut results = self.store.get_results(&ResultQuery::from_params(params))?;
        results.retain(|r| r.meta.log_components.as_ref() == log_components);
        Ok(results)
    }

    /// Jobs needed so that every combination of `specs` has `runs` results.
    ///
    /// Combinations that fix `RngRun` are run once if absent. Fresh seeds are
    /// the smallest values unused anywhere in the campaign. Each job carries
    /// the mean elapsed time of its stored equivalents as an estimate.
    pub fn get_missing_simulations(
        &self,
        specs: &[ParamSpec],
        runs: Option<usize>,
        log_components: Option<&LogComponents>,
    ) -> SemResult<Vec<Job>> {
        let mut planned = HashSet::new();
        let mut combinations = Vec::new();
        for spec in specs {
            for combination in self.fill_defaults(spec)?.expand()? {
                if planned.insert(combination_key(&combination, false)) {
                    combinations.push(combination);
                }
            }
        }

        // Seeds fixed anywhere in the batch are never handed out again.
        let mut seeds = self.store.next_rngruns();
        for seed in combinations.iter().filter_map(sem_core::rngrun_of) {
            seeds.reserve(seed);
        }

        let mut jobs = Vec::new();
        for combination in combinations {
            let existing = self.stored_matches(&combination, log_components)?;
            if combination.contains_key(RNGRUN) {
                if existing.is_empty() {
                    jobs.push(Job::new(combination));
                }
                continue;
            }

            let runs = runs.ok_or_else(|| {
                SemError::bad_spec("a run count is required when the spec does not set RngRun")
            })?;
            let estimate = mean_elapsed(&existing);
            for _ in existing.len()..runs {
                let mut params = combination.clone();
                params.insert(RNGRUN.to_string(), ParamValue::Int(seeds.allocate()));
                let mut job = Job::new(params);
                job.estimate = estimate;
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn run_missing_simulations(&self, spec: &ParamSpec, options: RunOptions) -> SemResult<RunReport> {
        self.run_missing_simulations_for(std::slice::from_ref(spec), options).await
    }

    /// Runs whatever `specs` still lacks and stores the results.
    ///
    /// With a condition, combinations are repeated with fresh seeds until the
    /// condition holds for each of them.
    pub async fn run_missing_simulations_for(
        &self,
        specs: &[ParamSpec],
        options: RunOptions,
    ) -> SemResult<RunReport> {
        let RunOptions {
            runs,
            condition,
            log_components,
        } = options;

        match condition {
            Some(condition) => {
                let mut planned = HashSet::new();
                let mut jobs = Vec::new();
                for spec in specs {
                    if spec.contains_key(RNGRUN) {
                        return Err(SemError::bad_spec("RngRun cannot be fixed for conditional runs"));
                    }
                    for combination in self.fill_defaults(spec)?.expand()? {
                        if planned.insert(combination_key(&combination, false)) {
                            jobs.push(Job::new(combination));
                        }
                    }
                }
                let store = self.store.clone();
                let condition: StopCondition =
                    Arc::new(move |params: &ParamMap| condition(store.as_ref(), params));
                let runner = Arc::new(ConditionalRunner::new(self.runner.build()));
                self.dispatch(runner, jobs, None, log_components, Some(condition)).await
            }
            None => {
                let jobs = self.get_missing_simulations(specs, runs, log_components.as_ref())?;
                if jobs.is_empty() {
                    info!("Nothing to run: all requested results are present");
                    return Ok(RunReport::default());
                }
                let total = Some(jobs.len());
                self.dispatch(self.runner.build(), jobs, total, log_components, None).await
            }
        }
    }

    fn context(&self, log_components: Option<LogComponents>) -> RunContext {
        RunContext::new(self.simulator.clone(), self.store.data_dir())
            .with_config(self.config.clone())
            .with_log_components(log_components)
            .with_observers(self.observers.clone())
    }

    async fn dispatch(
        &self,
        runner: Arc<dyn Runner>,
        mut jobs: Vec<Job>,
        total: Option<usize>,
        log_components: Option<LogComponents>,
        condition: Option<StopCondition>,
    ) -> SemResult<RunReport> {
        if log_components.is_some() && !self.simulator.supports_logging() {
            return Err(SemError::LoggingUnsupported(format!(
                "{} was not built with logging enabled",
                self.simulator.script()
            )));
        }
        self.check_commit().await?;

        if self.config.shuffle && self.runner != RunnerKind::Lpt {
            jobs.shuffle(&mut rand::thread_rng());
        }

        let mut seeds = self.store.next_rngruns();
        for job in &jobs {
            if let Some(seed) = sem_core::rngrun_of(&job.params) {
                seeds.reserve(seed);
            }
        }
        let logging = log_components.is_some();
        let mut ctx = self.context(log_components).with_seeds(seeds);
        if let Some(condition) = condition {
            ctx = ctx.with_condition(condition);
        }

        info!("Dispatching {} jobs to the {} runner", jobs.len(), runner.name());
        self.observers.on_simulation_start(total);
        let mut stream = runner.run(jobs, Arc::new(ctx));
        let flush_interval = Duration::from_secs(self.config.flush_interval_secs);
        let mut last_flush = Instant::now();
        let mut report = RunReport::default();

        // After the first error the runner stops scheduling, but runs already
        // in flight still complete and must reach the catalog.
        let mut first_error: Option<SemError> = None;
        while let Some(item) = stream.next().await {
            let result = match item {
                Ok(result) => result,
                Err(e) => {
                    if first_error.is_none() {
                        warn!("Batch stopping, draining in-flight runs: {}", e);
                        first_error = Some(e);
                    }
                    continue;
                }
            };
            let id = result.meta.id.clone();
            if let Err(e) = self.store.stage_result(result) {
                first_error.get_or_insert(e);
                continue;
            }
            report.results_inserted += 1;
            if logging {
                report.log_files.push(self.store.result_dir(&id).join("stderr"));
            }
            if last_flush.elapsed() >= flush_interval {
                if let Err(e) = self.store.flush() {
                    first_error.get_or_insert(e);
                }
                last_flush = Instant::now();
            }
        }

        self.store.flush()?;
        self.observers.on_simulation_end();
        match first_error {
            Some(e) => {
                warn!("Batch aborted after {} results: {}", report.results_inserted, e);
                Err(e)
            }
            None => Ok(report),
        }
    }

    /// Runs one combination, filling defaults and a fresh `RngRun` if absent.
    pub async fn run_single_simulation(&self, params: ParamMap) -> SemResult<SimulationResult> {
        let mut spec = ParamSpec::new();
        for (key, value) in params {
            spec.insert(key, SpecValue::Scalar(value));
        }
        let mut combination = self
            .fill_defaults(&spec)?
            .expand()?
            .into_iter()
            .next()
            .ok_or_else(|| SemError::bad_spec("combination expanded to nothing"))?;
        if !combination.contains_key(RNGRUN) {
            let seed = self.store.next_rngruns().allocate();
            combination.insert(RNGRUN.to_string(), ParamValue::Int(seed));
        }
        self.check_commit().await?;

        let ctx = self.context(None);
        let result = run_single(&ctx, combination).await?;
        self.store.insert_result(result.clone())?;
        if self.config.stop_on_errors && !result.succeeded() {
            return Err(SemError::SimulationFailed {
                id: result.meta.id,
                exitcode: result.meta.exitcode,
            });
        }
        Ok(result)
    }

    /// Shell command that reproduces `result`.
    pub fn get_command_from_result(&self, result: &SimulationResult) -> String {
        self.simulator.command_line(&result.params)
    }

    // ------------------------------------------------------------------------
    // Projections
    // ------------------------------------------------------------------------

    /// The first `runs` results of `params`, ordered by `RngRun`.
    fn runs_of(&self, params: &ParamMap, runs: Option<usize>) -> SemResult<Vec<SimulationResult>> {
        let mut results = self.store.get_results(&ResultQuery::from_params(params))?;
        results.sort_by_key(|r| sem_core::rngrun_of(&r.params));
        if let Some(runs) = runs {
            results.truncate(runs);
        }
        Ok(results)
    }

    /// Parses `runs` results per combination of `spec` into an array of shape
    /// `(|axis_1|, ..., |axis_n|, runs, ...)`, axes in `spec` key order and
    /// the parser output's own shape last. A scalar parser adds no trailing
    /// dimension.
    ///
    /// Every combination must have at least `runs` results and every parser
    /// output must have the same shape.
    pub fn get_results_as_array<F, T>(&self, spec: &ParamSpec, parser: F, runs: usize) -> SemResult<ResultArray>
    where
        F: Fn(&CompleteResult) -> SemResult<T>,
        T: ParsedValues,
    {
        if spec.contains_key(RNGRUN) {
            return Err(SemError::bad_spec("RngRun cannot be an array axis"));
        }
        let mut shape: Vec<usize> = spec.axes()?.iter().map(|(_, values)| values.len()).collect();
        shape.push(runs);

        let mut data = Vec::new();
        let mut item_shape: Option<Vec<usize>> = None;
        for combination in spec.expand()? {
            let results = self.runs_of(&combination, Some(runs))?;
            if results.len() < runs {
                return Err(SemError::IncompleteCoverage(format!(
                    "{} of {} runs available for {:?}",
                    results.len(),
                    runs,
                    combination
                )));
            }
            for result in results {
                let (parsed_shape, values) = parser(&self.store.complete(result, None)?)?.into_shaped()?;
                match &item_shape {
                    None => item_shape = Some(parsed_shape),
                    Some(expected) if *expected != parsed_shape => {
                        return Err(SemError::bad_structure(format!(
                            "parser returned shape {:?}, expected {:?}",
                            parsed_shape, expected
                        )))
                    }
                    Some(_) => {}
                }
                data.extend(values);
            }
        }
        shape.extend(item_shape.unwrap_or_default());
        Ok(ResultArray { shape, data })
    }

    /// One row per parsed row of each selected result: the parameter columns
    /// followed by `columns`.
    ///
    /// `param_columns` picks which parameters (and `RngRun`) to include, in
    /// that order; `None` includes every parameter followed by `RngRun`.
    /// Without a spec every stored result is used.
    pub fn get_results_as_frame<F>(
        &self,
        parser: F,
        columns: &[&str],
        param_columns: Option<&[&str]>,
        spec: Option<&ParamSpec>,
        runs: Option<usize>,
        drop_constant_columns: bool,
    ) -> SemResult<ResultFrame>
    where
        F: Fn(&CompleteResult) -> SemResult<Vec<Vec<f64>>>,
    {
        let known = self.store.params();
        let param_columns: Vec<String> = match param_columns {
            Some(names) => {
                if let Some(unknown) = names.iter().find(|n| **n != RNGRUN && !known.contains_key(**n)) {
                    return Err(SemError::UnknownParam(unknown.to_string()));
                }
                names.iter().map(|n| n.to_string()).collect()
            }
            None => known
                .keys()
                .cloned()
                .chain(std::iter::once(RNGRUN.to_string()))
                .collect(),
        };

        let results = match spec {
            Some(spec) => {
                let mut selected = Vec::new();
                for combination in spec.expand()? {
                    selected.extend(self.runs_of(&combination, runs)?);
                }
                selected
            }
            None => self.store.all_results(),
        };

        let mut frame = ResultFrame::new(
            param_columns
                .iter()
                .cloned()
                .chain(columns.iter().map(|c| c.to_string()))
                .collect(),
        );

        for result in results {
            let complete = self.store.complete(result, None)?;
            for row in parser(&complete)? {
                if row.len() != columns.len() {
                    return Err(SemError::bad_structure(format!(
                        "parser returned a row of {} values for {} columns",
                        row.len(),
                        columns.len()
                    )));
                }
                let mut cells: Vec<ParamValue> = param_columns
                    .iter()
                    .map(|name| complete.params().get(name).cloned().unwrap_or_else(|| ParamValue::from("")))
                    .collect();
                cells.extend(row.into_iter().map(ParamValue::Float));
                frame.rows.push(cells);
            }
        }

        if drop_constant_columns {
            frame.drop_constant_columns();
        }
        Ok(frame)
    }

    /// Copies output files into `root/key=value/.../run=<j>/`, at most `runs`
    /// per combination. Returns the number of run directories written.
    pub fn save_to_folders(&self, spec: &ParamSpec, root: &Path, runs: usize) -> SemResult<usize> {
        require_absolute(root)?;
        let mut written = 0;
        for combination in spec.expand()? {
            let mut dir = root.to_path_buf();
            for (key, value) in &combination {
                dir.push(format!("{}={}", key, value).replace('/', "_"));
            }
            fs::create_dir_all(&dir)?;

            for (run, result) in self.runs_of(&combination, Some(runs))?.iter().enumerate() {
                let run_dir = dir.join(format!("run={}", run));
                fs::create_dir_all(&run_dir)?;
                for (name, path) in self.store.result_files(&result.meta.id)? {
                    fs::copy(&path, run_dir.join(&name))?;
                }
                written += 1;
            }
        }
        info!("Saved {} runs under {}", written, root.display());
        Ok(written)
    }

    /// Parses the log output of a stored result.
    pub fn parse_result_logs(&self, id: &str) -> SemResult<(LogStore, LogSummary)> {
        if self.store.get_results(&ResultQuery::by_id(id))?.is_empty() {
            return Err(SemError::NoResults(format!("no result with id {}", id)));
        }
        process_logs(self.store.result_dir(id).join("stderr"))
    }
}

fn mean_elapsed(results: &[SimulationResult]) -> Option<Duration> {
    if results.is_empty() {
        return None;
    }
    let total: f64 = results.iter().map(|r| r.meta.elapsed_time).sum();
    Duration::try_from_secs_f64(total / results.len() as f64).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::{stdout_table, stdout_value, stdout_values};
    use proptest::prelude::*;
    use sem_core::param_map;
    use sem_env::{InProcessSimulator, SimOutput};
    use std::collections::BTreeSet;

    fn simulator() -> InProcessSimulator {
        InProcessSimulator::new("scratch-sim", |params, env| {
            let get = |key: &str| params.get(key).and_then(ParamValue::as_f64).unwrap_or(f64::NAN);
            let log = env.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect::<String>();
            SimOutput {
                exit_code: if get("p") < 0.0 { 2 } else { 0 },
                stdout: format!("{} {} {}\n", get("p"), get("q"), get(RNGRUN)),
                stderr: log,
                files: vec![("trace.txt".to_string(), b"trace".to_vec())],
            }
        })
        .with_param("p", Some(ParamValue::Int(1)))
        .with_param("q", Some(ParamValue::Int(10)))
        .with_commit("rev-1")
    }

    async fn manager(dir: &Path, sim: Arc<InProcessSimulator>) -> CampaignManager {
        CampaignManager::new(dir.join("campaign"), sim, false)
            .await
            .unwrap()
            .with_config(RunnerConfig::default().with_max_workers(2))
    }

    fn pq_spec(ps: &[i64], qs: &[i64]) -> ParamSpec {
        ParamSpec::new()
            .with_list("p", ps.iter().copied())
            .with_list("q", qs.iter().copied())
    }

    #[tokio::test]
    async fn test_run_missing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator());
        let manager = manager(dir.path(), sim.clone()).await;
        let spec = pq_spec(&[1, 2], &[10]);

        let report = manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();
        assert_eq!(report.results_inserted, 2);
        assert!(report.log_files.is_empty());
        assert_eq!(manager.store().len(), 2);

        let report = manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();
        assert_eq!(report.results_inserted, 0);
        assert_eq!(manager.store().len(), 2);
        assert_eq!(sim.invocations(), 2);

        for result in manager.store().all_results() {
            let complete = manager.store().get_complete_results(&ResultQuery::by_id(result.id()), None).unwrap();
            assert!(complete[0].output.contains_key("stdout"));
            assert!(complete[0].output.contains_key("trace.txt"));
        }
    }

    #[tokio::test]
    async fn test_missing_runs_are_topped_up() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let spec = pq_spec(&[1], &[10, 20]);

        manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();
        let jobs = manager.get_missing_simulations(&[spec.clone()], Some(3), None).unwrap();
        assert_eq!(jobs.len(), 4);
        assert!(jobs.iter().all(|j| j.estimate.is_some()));
        let seeds: BTreeSet<i64> = jobs.iter().filter_map(|j| sem_core::rngrun_of(&j.params)).collect();
        assert_eq!(seeds, [2, 3, 4, 5].into_iter().collect());

        manager.run_missing_simulations(&spec, RunOptions::runs(3)).await.unwrap();
        assert_eq!(manager.store().len(), 6);
    }

    #[tokio::test]
    async fn test_runs_required_without_rngrun() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let err = manager
            .run_missing_simulations(&pq_spec(&[1], &[10]), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SemError::BadSpec(_)));
    }

    #[tokio::test]
    async fn test_explicit_rngrun() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let spec = ParamSpec::new().with_value("p", 3).with_list(RNGRUN, [7, 9]);

        let report = manager.run_missing_simulations(&spec, RunOptions::default()).await.unwrap();
        assert_eq!(report.results_inserted, 2);
        let report = manager.run_missing_simulations(&spec, RunOptions::default()).await.unwrap();
        assert_eq!(report.results_inserted, 0);

        let seeds: BTreeSet<i64> = manager
            .store()
            .all_results()
            .iter()
            .filter_map(|r| sem_core::rngrun_of(&r.params))
            .collect();
        assert_eq!(seeds, [7, 9].into_iter().collect());
    }

    #[tokio::test]
    async fn test_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;

        let filled = manager.fill_defaults(&ParamSpec::new().with_value("p", 5)).unwrap();
        assert_eq!(
            filled.expand().unwrap(),
            vec![param_map([("p", 5), ("q", 10)])]
        );

        let err = manager.fill_defaults(&ParamSpec::new().with_value("nope", 1)).unwrap_err();
        assert!(matches!(err, SemError::UnknownParam(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_missing_param_without_default() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator().with_param("label", None));
        let manager = manager(dir.path(), sim).await;

        let err = manager
            .run_missing_simulations(&ParamSpec::new().with_value("p", 1), RunOptions::runs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SemError::MissingParam(name) if name == "label"));

        let spec = ParamSpec::new().with_value("label", "a/b");
        manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();
        assert_eq!(manager.store().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator());
        let manager = manager(dir.path(), sim.clone()).await;
        sim.set_commit("rev-2");

        let spec = pq_spec(&[1], &[10]);
        let err = manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            SemError::CommitMismatch { ref expected, ref found } if expected == "rev-1" && found == "rev-2"
        ));
        assert_eq!(sim.invocations(), 0);

        let manager = manager.with_config(RunnerConfig::default().with_check_commit(false));
        manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();
        assert_eq!(manager.store().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator());
        let first = manager(dir.path(), sim.clone()).await;
        first
            .run_missing_simulations(&pq_spec(&[1], &[10]), RunOptions::runs(2))
            .await
            .unwrap();

        let reopened = CampaignManager::new(dir.path().join("campaign"), sim.clone(), false)
            .await
            .unwrap();
        assert_eq!(reopened.store().len(), 2);

        let other = Arc::new(simulator().with_param("extra", Some(ParamValue::Int(0))));
        let err = CampaignManager::new(dir.path().join("campaign"), other, false)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SemError::AlreadyExists(_)));

        let fresh = CampaignManager::new(dir.path().join("campaign"), sim, true)
            .await
            .unwrap();
        assert!(fresh.store().is_empty());
    }

    #[tokio::test]
    async fn test_logging_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator());
        let manager = manager(dir.path(), sim.clone()).await;
        let components = LogComponents::parse([("WifiPhy", "all")], None).unwrap();

        let err = manager
            .run_missing_simulations(
                &pq_spec(&[1], &[10]),
                RunOptions::runs(1).with_log_components(components),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SemError::LoggingUnsupported(_)));
        assert_eq!(sim.invocations(), 0);
    }

    #[tokio::test]
    async fn test_logging_runs_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator().with_logging(["WifiPhy", "WifiMac"]));
        let manager = manager(dir.path(), sim).await;
        let spec = pq_spec(&[1], &[10]);
        manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();

        let components = manager.log_components([("*", "level_info")]).await.unwrap();
        assert_eq!(components.len(), 2);
        let report = manager
            .run_missing_simulations(&spec, RunOptions::runs(1).with_log_components(components.clone()))
            .await
            .unwrap();
        assert_eq!(report.results_inserted, 1);
        assert_eq!(report.log_files.len(), 1);
        let logged = std::fs::read_to_string(&report.log_files[0]).unwrap();
        assert!(logged.starts_with("NS_LOG="));

        // Same severities spelled differently are the same runs.
        let respelled = LogComponents::parse(
            [("WifiPhy", "error|warn|debug|info"), ("WifiMac", "level_info")],
            None,
        )
        .unwrap();
        let report = manager
            .run_missing_simulations(&spec, RunOptions::runs(1).with_log_components(respelled))
            .await
            .unwrap();
        assert_eq!(report.results_inserted, 0);
        assert_eq!(manager.store().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_on_errors_keeps_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator()))
            .await
            .with_runner(RunnerKind::Sequential)
            .with_config(RunnerConfig::default().with_stop_on_errors(true).with_shuffle(false));

        let err = manager
            .run_missing_simulations(&pq_spec(&[1, -1, 2], &[10]), RunOptions::runs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SemError::SimulationFailed { exitcode: 2, .. }));
        assert_eq!(manager.store().len(), 2);
        let reloaded = CampaignStore::load(manager.store().dir()).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_errors_stores_runs_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator().with_runtime(|params| {
            let p = params.get("p").and_then(ParamValue::as_i64).unwrap_or(0);
            Duration::from_secs(p.unsigned_abs())
        }));
        let manager = manager(dir.path(), sim.clone())
            .await
            .with_runner(RunnerKind::Parallel)
            .with_config(
                RunnerConfig::default()
                    .with_max_workers(2)
                    .with_stop_on_errors(true)
                    .with_shuffle(false),
            );

        // p=-1 fails after 1s while p=5 is still running.
        let err = manager
            .run_missing_simulations(&pq_spec(&[5, -1], &[10]), RunOptions::runs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SemError::SimulationFailed { exitcode: 2, .. }));
        assert_eq!(sim.invocations(), 2);
        assert_eq!(manager.store().len(), 2);
        assert_eq!(std::fs::read_dir(manager.store().data_dir()).unwrap().count(), 2);

        let reloaded = CampaignStore::load(manager.store().dir()).unwrap();
        assert_eq!(reloaded.len(), 2);
        let ps: BTreeSet<i64> = reloaded
            .all_results()
            .iter()
            .filter_map(|r| r.params.get("p").and_then(ParamValue::as_i64))
            .collect();
        assert_eq!(ps, [-1, 5].into_iter().collect());
    }

    #[tokio::test]
    async fn test_explicit_rngrun_is_not_reallocated() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let specs = [
            ParamSpec::new().with_value("p", 0).with_value(RNGRUN, 0),
            ParamSpec::new().with_value("p", 0),
        ];

        let jobs = manager.get_missing_simulations(&specs, Some(1), None).unwrap();
        let seeds: Vec<Option<i64>> = jobs.iter().map(|j| sem_core::rngrun_of(&j.params)).collect();
        assert_eq!(seeds, vec![Some(0), Some(1)]);

        let report = manager
            .run_missing_simulations_for(&specs, RunOptions::runs(1))
            .await
            .unwrap();
        assert_eq!(report.results_inserted, 2);
        let stored: BTreeSet<i64> = manager
            .store()
            .get_results(&ResultQuery::new().with_param("p", 0))
            .unwrap()
            .iter()
            .filter_map(|r| sem_core::rngrun_of(&r.params))
            .collect();
        assert_eq!(stored, [0, 1].into_iter().collect());
    }

    #[tokio::test]
    async fn test_conditional_runs_converge() {
        for workers in [1, 4] {
            let dir = tempfile::tempdir().unwrap();
            let manager = manager(dir.path(), Arc::new(simulator()))
                .await
                .with_config(RunnerConfig::default().with_max_workers(workers));
            let spec = pq_spec(&[1, 2, 3], &[10]);

            let report = manager
                .run_missing_simulations(
                    &spec,
                    RunOptions::until(|store, params| {
                        store
                            .get_results(&ResultQuery::from_params(params))
                            .map(|r| r.len() >= 2)
                            .unwrap_or(false)
                    }),
                )
                .await
                .unwrap();
            assert_eq!(report.results_inserted, 6, "workers = {}", workers);
            for p in [1, 2, 3] {
                let runs = manager
                    .store()
                    .get_results(&ResultQuery::new().with_param("p", p))
                    .unwrap();
                assert_eq!(runs.len(), 2);
            }
        }
    }

    #[tokio::test]
    async fn test_lpt_runner_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator()))
            .await
            .with_runner(RunnerKind::Lpt)
            .with_config(RunnerConfig::default().with_lpt_seed(5));
        let spec = pq_spec(&[1, 2], &[10, 20]);
        manager.run_missing_simulations(&spec, RunOptions::runs(2)).await.unwrap();
        assert_eq!(manager.store().len(), 8);
    }

    #[tokio::test]
    async fn test_results_as_array_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let spec = pq_spec(&[1, 2, 3], &[10, 20]);
        manager.run_missing_simulations(&spec, RunOptions::runs(2)).await.unwrap();

        let array = manager.get_results_as_array(&spec, stdout_values, 2).unwrap();
        assert_eq!(array.shape, vec![3, 2, 2, 3]);
        for (i, p) in [1.0, 2.0, 3.0].iter().enumerate() {
            for (j, q) in [10.0, 20.0].iter().enumerate() {
                let first = array.get(&[i, j, 0]).unwrap();
                let second = array.get(&[i, j, 1]).unwrap();
                assert_eq!((first[0], first[1]), (*p, *q));
                assert_eq!((second[0], second[1]), (*p, *q));
                assert!(first[2] < second[2]);
            }
        }

        let scalars = manager.get_results_as_array(&spec, stdout_value, 2).unwrap();
        assert_eq!(scalars.shape, vec![3, 2, 2]);
        assert_eq!(scalars.len(), 12);
        assert_eq!(scalars.value(&[2, 1, 0]), Some(3.0));

        let err = manager.get_results_as_array(&spec, stdout_values, 3).unwrap_err();
        assert!(matches!(err, SemError::IncompleteCoverage(_)));

        // Output length depends on p, so the results cannot share a shape.
        let ragged = |r: &CompleteResult| -> SemResult<Vec<f64>> {
            let values = stdout_values(r)?;
            let p = values[0] as usize;
            Ok(values.into_iter().take(p).collect())
        };
        let err = manager.get_results_as_array(&spec, ragged, 2).unwrap_err();
        assert!(matches!(err, SemError::BadStructure(_)));

        let derived = ParamSpec::new()
            .with_list("p", [1, 2])
            .derive("q", &["p"], |m| vec![ParamValue::Int(m["p"].as_i64().unwrap_or(0) * 10)]);
        let err = manager.get_results_as_array(&derived, stdout_values, 1).unwrap_err();
        assert!(matches!(err, SemError::BadSpec(_)));
    }

    #[tokio::test]
    async fn test_results_as_frame() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let spec = pq_spec(&[1, 2], &[10]);
        manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();

        let frame = manager
            .get_results_as_frame(stdout_table, &["a", "b", "c"], None, Some(&spec), None, false)
            .unwrap();
        assert_eq!(frame.columns, vec!["p", "q", RNGRUN, "a", "b", "c"]);
        assert_eq!(frame.len(), 2);

        let frame = manager
            .get_results_as_frame(stdout_table, &["a", "b", "c"], None, None, None, true)
            .unwrap();
        assert_eq!(frame.columns, vec!["p", RNGRUN, "a", "c"]);

        let err = manager
            .get_results_as_frame(stdout_table, &["only"], None, None, None, false)
            .unwrap_err();
        assert!(matches!(err, SemError::BadStructure(_)));
    }

    #[tokio::test]
    async fn test_results_as_frame_param_subset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(simulator())).await;
        let spec = pq_spec(&[1, 2], &[10, 20]);
        manager.run_missing_simulations(&spec, RunOptions::runs(1)).await.unwrap();

        let frame = manager
            .get_results_as_frame(stdout_table, &["a", "b", "c"], Some(&["p"][..]), Some(&spec), None, false)
            .unwrap();
        assert_eq!(frame.columns, vec!["p", "a", "b", "c"]);
        assert_eq!(frame.len(), 4);
        for row in &frame.rows {
            assert_eq!(row[0].as_f64(), row[1].as_f64());
        }

        let frame = manager
            .get_results_as_frame(stdout_table, &["c"], Some(&[RNGRUN, "q"][..]), None, None, false)
            .unwrap();
        assert_eq!(frame.columns, vec![RNGRUN, "q", "c"]);

        let err = manager
            .get_results_as_frame(stdout_table, &["a", "b", "c"], Some(&["nope"][..]), None, None, false)
            .unwrap_err();
        assert!(matches!(err, SemError::UnknownParam(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_save_to_folders() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator().with_param("label", Some(ParamValue::from("a/b"))));
        let manager = manager(dir.path(), sim).await;
        let spec = pq_spec(&[1, 2], &[10]);
        manager.run_missing_simulations(&spec, RunOptions::runs(2)).await.unwrap();

        let out = dir.path().join("export");
        let written = manager
            .save_to_folders(&ParamSpec::new().with_list("p", [1, 2]).with_value("label", "a/b"), &out, 1)
            .unwrap();
        assert_eq!(written, 2);
        let leaf = out.join("p=1").join("label=a_b").join("run=0");
        assert!(leaf.join("stdout").is_file());
        assert!(leaf.join("trace.txt").is_file());
        assert!(!out.join("p=1").join("label=a_b").join("run=1").exists());

        let err = manager
            .save_to_folders(&spec, Path::new("relative"), 1)
            .unwrap_err();
        assert!(matches!(err, SemError::RelativePath(_)));
    }

    #[tokio::test]
    async fn test_run_single_simulation() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(simulator());
        let manager = manager(dir.path(), sim).await;

        let result = manager.run_single_simulation(param_map([("p", 4)])).await.unwrap();
        assert_eq!(result.params, param_map([("p", 4), ("q", 10), (RNGRUN, 0)]));
        assert_eq!(manager.store().len(), 1);
        assert_eq!(
            manager.get_command_from_result(&result),
            "scratch-sim --p=4 --q=10 --RngRun=0"
        );

        let second = manager.run_single_simulation(param_map([("p", 4)])).await.unwrap();
        assert_eq!(sem_core::rngrun_of(&second.params), Some(1));
    }

    #[tokio::test]
    async fn test_parse_result_logs() {
        let dir = tempfile::tempdir().unwrap();
        let sim = Arc::new(InProcessSimulator::new("logger", |_, _| SimOutput {
            stderr: "+1.000000000s 0 WifiPhy:Send(): [INFO ] sent\n+2.000000000s 1 WifiMac:Rx(a)\n".to_string(),
            ..SimOutput::default()
        }));
        let manager = manager(dir.path(), sim).await;
        let result = manager.run_single_simulation(ParamMap::new()).await.unwrap();

        let (logs, summary) = manager.parse_result_logs(result.id()).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(summary.components.len(), 2);
        assert!(matches!(manager.parse_result_logs("missing"), Err(SemError::NoResults(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_seeds_unique_per_combination(
            ps in prop::collection::vec(0i64..3, 1..4),
            first in 1usize..3,
            second in 1usize..4,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let dir = tempfile::tempdir().unwrap();
                let manager = manager(dir.path(), Arc::new(simulator())).await;
                let spec = ParamSpec::new().with_list("p", ps.clone());
                manager.run_missing_simulations(&spec, RunOptions::runs(first)).await.unwrap();
                manager.run_missing_simulations(&spec, RunOptions::runs(second)).await.unwrap();

                let mut seen = HashSet::new();
                for result in manager.store().all_results() {
                    let key = combination_key(&result.params, true);
                    let seed = sem_core::rngrun_of(&result.params);
                    prop_assert!(seen.insert((key, seed)));
                }
                let distinct: BTreeSet<i64> = ps.iter().copied().collect();
                prop_assert_eq!(manager.store().len(), distinct.len() * first.max(second));
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
