//! Runners: strategies that turn combinations into a stream of results.
//!
//! Every runner shares the single-run semantics of [`run_single`] and differs
//! only in scheduling:
//!
//! | Runner | Scheduling |
//! |--------|------------|
//! | [`SequentialRunner`] | one run at a time, in input order |
//! | [`ParallelRunner`] | `W` workers pulling from a depth-1 queue |
//! | [`LptRunner`] | `W` slots, longest expected group first |
//! | [`ConditionalRunner`] | rounds of fresh seeds until a predicate holds |
//!
//! Results come out in completion order.

mod conditional;
mod kind;
mod lpt;
mod parallel;
mod sequential;

pub use conditional::ConditionalRunner;
pub use kind::RunnerKind;
pub use lpt::LptRunner;
pub use parallel::ParallelRunner;
pub use sequential::SequentialRunner;

use crate::config::RunnerConfig;
use crate::observer::{Observers, RunObserver};
use parking_lot::Mutex;
use sem_core::{
    LogComponents, ParamMap, ResultMeta, RngRunAllocator, SemError, SemResult, SimulationResult,
    LOG_ENV_VAR,
};
use sem_env::Simulator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Predicate deciding whether a combination has enough results.
pub type StopCondition = Arc<dyn Fn(&ParamMap) -> bool + Send + Sync>;

/// Item of a [`ResultStream`].
pub type RunItem = SemResult<SimulationResult>;

/// One unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Full combination, including `RngRun` unless the runner allocates it
    pub params: ParamMap,

    /// Expected duration, used by LPT scheduling
    pub estimate: Option<Duration>,
}

impl Job {
    pub fn new(params: ParamMap) -> Self {
        Self {
            params,
            estimate: None,
        }
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimate = Some(estimate);
        self
    }
}

/// Everything a run needs besides its parameters.
pub struct RunContext {
    pub simulator: Arc<dyn Simulator>,

    /// Campaign `data/` directory; each run gets `data/<id>/`
    pub data_dir: PathBuf,

    pub config: RunnerConfig,

    /// Logging to enable for every run
    pub log_components: Option<LogComponents>,

    pub observers: Observers,

    /// Seed source for runners that allocate `RngRun` themselves
    pub seeds: Arc<Mutex<RngRunAllocator>>,

    /// Convergence predicate for conditional runs
    pub condition: Option<StopCondition>,
}

impl RunContext {
    pub fn new(simulator: Arc<dyn Simulator>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            simulator,
            data_dir: data_dir.into(),
            config: RunnerConfig::default(),
            log_components: None,
            observers: Observers::new(),
            seeds: Arc::new(Mutex::new(RngRunAllocator::new([]))),
            condition: None,
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_log_components(mut self, log_components: Option<LogComponents>) -> Self {
        self.log_components = log_components;
        self
    }

    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    pub fn with_seeds(mut self, seeds: RngRunAllocator) -> Self {
        self.seeds = Arc::new(Mutex::new(seeds));
        self
    }

    pub fn with_condition(mut self, condition: StopCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Takes a fresh `RngRun`.
    pub fn next_seed(&self) -> i64 {
        self.seeds.lock().allocate()
    }
}

/// A scheduling strategy.
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts running `jobs` in the background. Must be called from within a
    /// tokio runtime.
    fn run(&self, jobs: Vec<Job>, ctx: Arc<RunContext>) -> ResultStream;
}

// ============================================================================
// RESULT STREAM
// ============================================================================

/// Results of a runner, in completion order.
///
/// On an acknowledged channel, asking for the next item acknowledges the
/// previous one, so a producer can tell when the consumer has finished with
/// everything it was given.
pub struct ResultStream {
    rx: mpsc::Receiver<RunItem>,
    acks: Option<mpsc::UnboundedSender<()>>,
    awaiting_ack: bool,
}

impl ResultStream {
    /// Next result, or `None` once the runner is done.
    pub async fn next(&mut self) -> Option<RunItem> {
        if std::mem::take(&mut self.awaiting_ack) {
            if let Some(acks) = &self.acks {
                let _ = acks.send(());
            }
        }
        let item = self.rx.recv().await;
        self.awaiting_ack = item.is_some() && self.acks.is_some();
        item
    }

    /// Drains the stream, stopping at the first error.
    pub async fn collect(mut self) -> SemResult<Vec<SimulationResult>> {
        let mut results = Vec::new();
        while let Some(item) = self.next().await {
            results.push(item?);
        }
        Ok(results)
    }
}

/// Producer side of a [`ResultStream`].
pub struct ResultSink {
    tx: mpsc::Sender<RunItem>,
    acks: Option<mpsc::UnboundedReceiver<()>>,
}

impl ResultSink {
    /// Sender for worker tasks.
    pub fn sender(&self) -> mpsc::Sender<RunItem> {
        self.tx.clone()
    }

    /// Sends an item; false once the stream is gone.
    pub async fn send(&self, item: RunItem) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Waits until the consumer has finished with `count` more items.
    /// Returns immediately on a channel created without acknowledgements.
    pub async fn acknowledged(&mut self, count: usize) -> bool {
        let Some(acks) = &mut self.acks else {
            return true;
        };
        for _ in 0..count {
            if acks.recv().await.is_none() {
                return false;
            }
        }
        true
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acks.is_some()
    }
}

/// Creates a connected sink/stream pair. The stream holds at most one
/// unread result, so a slow consumer throttles the workers.
pub fn result_channel() -> (ResultSink, ResultStream) {
    let (tx, rx) = mpsc::channel(1);
    (
        ResultSink { tx, acks: None },
        ResultStream {
            rx,
            acks: None,
            awaiting_ack: false,
        },
    )
}

/// Like [`result_channel`], but the stream acknowledges every item it hands
/// out. Only runners that wait on [`ResultSink::acknowledged`] need this.
pub fn acked_result_channel() -> (ResultSink, ResultStream) {
    let (tx, rx) = mpsc::channel(1);
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    (
        ResultSink {
            tx,
            acks: Some(ack_rx),
        },
        ResultStream {
            rx,
            acks: Some(ack_tx),
            awaiting_ack: false,
        },
    )
}

// ============================================================================
// SINGLE RUN
// ============================================================================

/// Runs one combination in a fresh `data/<id>/` directory.
///
/// A non-zero exit is not an error: it is recorded in `meta.exitcode` and
/// the directory is kept for inspection.
pub async fn run_single(ctx: &RunContext, params: ParamMap) -> SemResult<SimulationResult> {
    let mut env = Vec::new();
    if let Some(components) = &ctx.log_components {
        if !ctx.simulator.supports_logging() {
            return Err(SemError::LoggingUnsupported(format!(
                "{} was not built with logging enabled",
                ctx.simulator.script()
            )));
        }
        env.push((LOG_ENV_VAR.to_string(), components.to_env_value()));
    }

    let id = Uuid::new_v4().to_string();
    let dir = ctx.data_dir.join(&id);
    std::fs::create_dir_all(&dir)?;

    ctx.observers.on_run_start(&params, &id);
    let outcome = ctx.simulator.execute(&params, &dir, &env).await?;
    ctx.observers.on_run_end(&id, outcome.exit_code, outcome.elapsed);
    debug!("[{}] exit {} in {:.3}s", id, outcome.exit_code, outcome.elapsed.as_secs_f64());

    Ok(SimulationResult {
        params,
        meta: ResultMeta {
            id,
            elapsed_time: outcome.elapsed.as_secs_f64(),
            exitcode: outcome.exit_code,
            log_components: ctx.log_components.clone(),
        },
    })
}

/// Forwards the outcome of one run. Returns false when the batch must stop:
/// the consumer is gone, the run errored, or it failed with
/// `stop_on_errors` set.
pub(crate) async fn deliver(
    tx: &mpsc::Sender<RunItem>,
    ctx: &RunContext,
    outcome: SemResult<SimulationResult>,
) -> bool {
    match outcome {
        Ok(result) => {
            let failure = (result.meta.exitcode != 0).then(|| SemError::SimulationFailed {
                id: result.meta.id.clone(),
                exitcode: result.meta.exitcode,
            });
            if tx.send(Ok(result)).await.is_err() {
                return false;
            }
            match failure {
                Some(err) if ctx.config.stop_on_errors => {
                    let _ = tx.send(Err(err)).await;
                    false
                }
                _ => true,
            }
        }
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use sem_core::{ParamValue, RNGRUN};
    use sem_env::{InProcessSimulator, SimOutput};

    /// Simulator printing `2 * x`; negative `x` exits with 1. Runs take `x`
    /// seconds of tokio time.
    pub fn doubling_simulator() -> InProcessSimulator {
        InProcessSimulator::new("double", |params, _| {
            let x = params.get("x").and_then(ParamValue::as_i64).unwrap_or(0);
            if x < 0 {
                SimOutput::failed(1, "negative input\n")
            } else {
                SimOutput::ok(format!("{}\n", 2 * x))
            }
        })
        .with_param("x", Some(ParamValue::Int(1)))
        .with_runtime(|params| {
            let x = params.get("x").and_then(ParamValue::as_i64).unwrap_or(0);
            Duration::from_secs(x.unsigned_abs())
        })
    }

    pub fn jobs(xs: &[i64]) -> Vec<Job> {
        xs.iter()
            .enumerate()
            .map(|(seed, x)| {
                Job::new(sem_core::param_map([
                    ("x", ParamValue::Int(*x)),
                    (RNGRUN, ParamValue::Int(seed as i64)),
                ]))
            })
            .collect()
    }

    pub fn x_of(result: &SimulationResult) -> i64 {
        result.params.get("x").and_then(ParamValue::as_i64).unwrap_or(i64::MIN)
    }
}
