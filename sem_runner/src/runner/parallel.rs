//! Fixed-size worker pool fed through a depth-1 queue.

use super::{deliver, result_channel, run_single, Job, ResultStream, RunContext, Runner};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::debug;

/// Runs up to `max_workers` simulations at once.
///
/// Workers take the next combination as soon as they are free, so results
/// arrive in completion order. Closing the queue lets in-flight runs finish.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelRunner;

impl ParallelRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for ParallelRunner {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn run(&self, jobs: Vec<Job>, ctx: Arc<RunContext>) -> ResultStream {
        let (sink, stream) = result_channel();
        tokio::spawn(async move {
            let workers = ctx.config.workers().min(jobs.len().max(1));
            let (job_tx, job_rx) = mpsc::channel::<Job>(1);
            let job_rx = Arc::new(Mutex::new(job_rx));
            let stop = Arc::new(AtomicBool::new(false));
            debug!("Starting {} workers for {} jobs", workers, jobs.len());

            let mut pool = JoinSet::new();
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let tx = sink.sender();
                let ctx = ctx.clone();
                let stop = stop.clone();
                pool.spawn(async move {
                    loop {
                        let job = job_rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let outcome = run_single(&ctx, job.params).await;
                        if !deliver(&tx, &ctx, outcome).await {
                            stop.store(true, Ordering::SeqCst);
                            break;
                        }
                    }
                });
            }

            for job in jobs {
                if stop.load(Ordering::SeqCst) || job_tx.send(job).await.is_err() {
                    break;
                }
            }
            drop(job_tx);
            while pool.join_next().await.is_some() {}
        });
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::RunnerConfig;
    use crate::observer::{Observers, RunObserver};
    use sem_core::{ParamMap, SemError};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Concurrency {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl RunObserver for Concurrency {
        fn on_run_start(&self, _params: &ParamMap, _id: &str) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn on_run_end(&self, _id: &str, _exitcode: i32, _elapsed: Duration) {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn context(dir: &std::path::Path, config: RunnerConfig, concurrency: Arc<Concurrency>) -> Arc<RunContext> {
        let mut observers = Observers::new();
        observers.push(concurrency);
        Arc::new(
            RunContext::new(Arc::new(doubling_simulator()), dir)
                .with_config(config)
                .with_observers(observers),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order() {
        let dir = tempfile::tempdir().unwrap();
        let concurrency = Arc::new(Concurrency::default());
        let ctx = context(dir.path(), RunnerConfig::default().with_max_workers(3), concurrency.clone());

        let results = ParallelRunner::new()
            .run(jobs(&[5, 1, 3]), ctx)
            .collect()
            .await
            .unwrap();
        assert_eq!(results.iter().map(x_of).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(concurrency.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_limit() {
        let dir = tempfile::tempdir().unwrap();
        let concurrency = Arc::new(Concurrency::default());
        let ctx = context(dir.path(), RunnerConfig::default().with_max_workers(2), concurrency.clone());

        let results = ParallelRunner::new()
            .run(jobs(&[2, 2, 2, 2, 2]), ctx)
            .collect()
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(concurrency.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_on_errors() {
        let dir = tempfile::tempdir().unwrap();
        let concurrency = Arc::new(Concurrency::default());
        let config = RunnerConfig::default()
            .with_max_workers(1)
            .with_stop_on_errors(true);
        let ctx = context(dir.path(), config, concurrency);

        let err = ParallelRunner::new()
            .run(jobs(&[1, -1, 1, 1]), ctx)
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, SemError::SimulationFailed { exitcode: 1, .. }));
    }

    #[tokio::test]
    async fn test_empty_job_list() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), RunnerConfig::default(), Arc::new(Concurrency::default()));
        let results = ParallelRunner::new().run(Vec::new(), ctx).collect().await.unwrap();
        assert!(results.is_empty());
    }
}
