//! Repeat combinations until a stopping predicate is satisfied.

use super::{acked_result_channel, Job, ResultStream, RunContext, Runner};
use sem_core::{without_rngrun, ParamMap, ParamValue, SemError, RNGRUN};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs in rounds on top of another runner.
///
/// Each round evaluates the context's condition on every combination not yet
/// converged and schedules one fresh-seeded run for each that still needs
/// results. A round ends when the consumer has processed all of its results,
/// so the condition always sees them. The batch ends when every combination
/// has converged.
#[derive(Clone)]
pub struct ConditionalRunner {
    inner: Arc<dyn Runner>,
}

impl ConditionalRunner {
    pub fn new(inner: Arc<dyn Runner>) -> Self {
        Self { inner }
    }
}

impl Runner for ConditionalRunner {
    fn name(&self) -> &'static str {
        "conditional"
    }

    fn run(&self, jobs: Vec<Job>, ctx: Arc<RunContext>) -> ResultStream {
        let (mut sink, stream) = acked_result_channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let Some(condition) = ctx.condition.clone() else {
                sink.send(Err(SemError::runner("conditional runner started without a condition")))
                    .await;
                return;
            };

            let mut open: Vec<ParamMap> = jobs.iter().map(|j| without_rngrun(&j.params)).collect();
            let mut round = 0usize;
            loop {
                open.retain(|params| !condition(params));
                if open.is_empty() {
                    break;
                }
                round += 1;
                info!("Round {}: {} combinations not converged", round, open.len());

                let round_jobs: Vec<Job> = open
                    .iter()
                    .map(|params| {
                        let mut params = params.clone();
                        params.insert(RNGRUN.to_string(), ParamValue::Int(ctx.next_seed()));
                        Job::new(params)
                    })
                    .collect();

                let mut results = inner.run(round_jobs, ctx.clone());
                let mut forwarded = 0usize;
                let mut failed = false;
                while let Some(item) = results.next().await {
                    failed |= item.is_err();
                    if !sink.send(item).await {
                        return;
                    }
                    forwarded += 1;
                }
                // The inner runner has drained its in-flight runs; no new round.
                if failed || !sink.acknowledged(forwarded).await {
                    return;
                }
            }
            debug!("All combinations converged after {} rounds", round);
        });
        stream
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{ParallelRunner, StopCondition};
    use super::*;
    use crate::config::RunnerConfig;
    use parking_lot::Mutex;
    use sem_core::{combination_key, param_map, RngRunAllocator, SimulationResult};
    use std::collections::BTreeSet;

    fn counting_condition(store: Arc<Mutex<Vec<SimulationResult>>>, needed: usize) -> StopCondition {
        Arc::new(move |params: &ParamMap| {
            let key = combination_key(params, true);
            store
                .lock()
                .iter()
                .filter(|r| combination_key(&r.params, true) == key)
                .count()
                >= needed
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_condition_holds() {
        for workers in [1, 4] {
            let dir = tempfile::tempdir().unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let ctx = Arc::new(
                RunContext::new(Arc::new(doubling_simulator()), dir.path())
                    .with_config(RunnerConfig::default().with_max_workers(workers))
                    .with_seeds(RngRunAllocator::new([0, 2]))
                    .with_condition(counting_condition(seen.clone(), 2)),
            );
            let runner = ConditionalRunner::new(Arc::new(ParallelRunner::new()));
            let combos = vec![
                Job::new(param_map([("x", 1)])),
                Job::new(param_map([("x", 2)])),
            ];

            let mut stream = runner.run(combos, ctx);
            while let Some(item) = stream.next().await {
                seen.lock().push(item.unwrap());
            }

            let seen = seen.lock();
            assert_eq!(seen.len(), 4, "workers = {}", workers);
            assert_eq!(seen.iter().filter(|r| x_of(r) == 1).count(), 2);
            let seeds: BTreeSet<i64> = seen.iter().filter_map(|r| sem_core::rngrun_of(&r.params)).collect();
            assert_eq!(seeds.len(), 4);
            assert!(!seeds.contains(&0) && !seeds.contains(&2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_ends_batch_after_round_drains() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(
            RunContext::new(Arc::new(doubling_simulator()), dir.path())
                .with_config(RunnerConfig::default().with_max_workers(2).with_stop_on_errors(true))
                .with_condition(Arc::new(|_: &ParamMap| false)),
        );
        let runner = ConditionalRunner::new(Arc::new(ParallelRunner::new()));
        let combos = vec![
            Job::new(param_map([("x", 5)])),
            Job::new(param_map([("x", -1)])),
        ];

        let mut stream = runner.run(combos, ctx);
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }

        // One round only: the failure, its error, then the slow run.
        assert_eq!(items.len(), 3);
        assert_eq!(x_of(items[0].as_ref().unwrap()), -1);
        assert!(items[1].is_err());
        assert_eq!(x_of(items[2].as_ref().unwrap()), 5);
    }

    #[tokio::test]
    async fn test_already_converged() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(
            RunContext::new(Arc::new(doubling_simulator()), dir.path())
                .with_condition(Arc::new(|_: &ParamMap| true)),
        );
        let runner = ConditionalRunner::new(Arc::new(ParallelRunner::new()));
        let results = runner
            .run(vec![Job::new(param_map([("x", 1)]))], ctx)
            .collect()
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_missing_condition() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(RunContext::new(Arc::new(doubling_simulator()), dir.path()));
        let runner = ConditionalRunner::new(Arc::new(ParallelRunner::new()));
        let err = runner.run(Vec::new(), ctx).collect().await.unwrap_err();
        assert!(matches!(err, SemError::Runner(_)));
    }
}
