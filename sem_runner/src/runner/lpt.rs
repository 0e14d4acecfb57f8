//! Longest-processing-time-first scheduling.
//!
//! Pending jobs are grouped by combination (ignoring `RngRun`). Each group
//! carries an estimate of its per-run duration: the caller's estimate if one
//! was given, `+∞` otherwise, replaced by the last observed elapsed time as
//! runs complete. Whenever a worker slot frees up, the next job comes from the
//! group with the largest estimate; ties are broken by a seeded RNG.

use super::{deliver, result_channel, run_single, Job, ResultStream, RunContext, RunItem, Runner};
use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sem_core::{combination_key, CombinationKey, ParamMap};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

#[derive(Debug)]
struct Group {
    pending: VecDeque<ParamMap>,
    estimate: f64,
}

/// Pending work, grouped by equivalence class.
struct LptQueue {
    groups: IndexMap<CombinationKey, Group>,
    rng: ChaCha8Rng,
}

impl LptQueue {
    fn new(jobs: Vec<Job>, seed: Option<u64>) -> Self {
        let mut groups: IndexMap<CombinationKey, Group> = IndexMap::new();
        for job in jobs {
            let group = groups
                .entry(combination_key(&job.params, true))
                .or_insert_with(|| Group {
                    pending: VecDeque::new(),
                    estimate: f64::INFINITY,
                });
            if let Some(estimate) = job.estimate {
                group.estimate = estimate.as_secs_f64();
            }
            group.pending.push_back(job.params);
        }
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self { groups, rng }
    }

    fn is_empty(&self) -> bool {
        self.groups.values().all(|g| g.pending.is_empty())
    }

    /// Takes a job from the group with the largest estimate.
    fn pop(&mut self) -> Option<ParamMap> {
        let longest = self
            .groups
            .values()
            .filter(|g| !g.pending.is_empty())
            .map(|g| g.estimate)
            .fold(f64::NEG_INFINITY, f64::max);
        let candidates: Vec<usize> = self
            .groups
            .values()
            .enumerate()
            .filter(|(_, g)| !g.pending.is_empty() && g.estimate == longest)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let pick = candidates[self.rng.gen_range(0..candidates.len())];
        let (_, group) = self.groups.get_index_mut(pick)?;
        trace!("LPT pick: estimate {} among {} tied groups", group.estimate, candidates.len());
        group.pending.pop_front()
    }

    /// Records an observed duration for the group of `params`.
    fn observe(&mut self, params: &ParamMap, elapsed: f64) {
        if let Some(group) = self.groups.get_mut(&combination_key(params, true)) {
            group.estimate = elapsed;
        }
    }

    fn clear(&mut self) {
        self.groups.values_mut().for_each(|g| g.pending.clear());
    }
}

/// Parallel runner that launches the longest expected jobs first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LptRunner;

impl LptRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for LptRunner {
    fn name(&self) -> &'static str {
        "lpt"
    }

    fn run(&self, jobs: Vec<Job>, ctx: Arc<RunContext>) -> ResultStream {
        let (sink, stream) = result_channel();
        tokio::spawn(async move {
            let mut queue = LptQueue::new(jobs, ctx.config.lpt_seed);
            let slots = Arc::new(Semaphore::new(ctx.config.workers()));
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RunItem>();
            let tx = sink.sender();
            let mut in_flight = 0usize;
            let mut stopped = false;

            while in_flight > 0 || !queue.is_empty() {
                tokio::select! {
                    biased;

                    Some(outcome) = done_rx.recv() => {
                        in_flight -= 1;
                        if stopped {
                            // Draining: runs started before the stop are still reported.
                            if let Ok(result) = outcome {
                                let _ = tx.send(Ok(result)).await;
                            }
                            continue;
                        }
                        if let Ok(result) = &outcome {
                            queue.observe(&result.params, result.meta.elapsed_time);
                        }
                        if !deliver(&tx, &ctx, outcome).await {
                            queue.clear();
                            stopped = true;
                        }
                    }

                    permit = slots.clone().acquire_owned(), if !queue.is_empty() => {
                        let Ok(permit) = permit else { break };
                        let Some(params) = queue.pop() else { continue };
                        in_flight += 1;
                        let ctx = ctx.clone();
                        let done_tx = done_tx.clone();
                        tokio::spawn(async move {
                            let outcome = run_single(&ctx, params).await;
                            let _ = done_tx.send(outcome);
                            drop(permit);
                        });
                    }
                }
            }
            debug!("LPT dispatcher finished (stopped early: {})", stopped);
        });
        stream
    }
}
