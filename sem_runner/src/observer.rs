//! Progress notifications for simulation batches.

use sem_core::ParamMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives batch and per-run events. Every method defaults to a no-op.
///
/// Runs are reported from worker tasks, so calls may interleave.
pub trait RunObserver: Send + Sync {
    /// A batch is about to start. `total` is unknown for conditional runs.
    fn on_simulation_start(&self, _total: Option<usize>) {}

    fn on_run_start(&self, _params: &ParamMap, _id: &str) {}

    fn on_run_end(&self, _id: &str, _exitcode: i32, _elapsed: Duration) {}

    fn on_simulation_end(&self) {}
}

/// Fan-out over registered observers.
#[derive(Clone, Default)]
pub struct Observers(Vec<Arc<dyn RunObserver>>);

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn RunObserver>) {
        self.0.push(observer);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl RunObserver for Observers {
    fn on_simulation_start(&self, total: Option<usize>) {
        self.0.iter().for_each(|o| o.on_simulation_start(total));
    }

    fn on_run_start(&self, params: &ParamMap, id: &str) {
        self.0.iter().for_each(|o| o.on_run_start(params, id));
    }

    fn on_run_end(&self, id: &str, exitcode: i32, elapsed: Duration) {
        self.0.iter().for_each(|o| o.on_run_end(id, exitcode, elapsed));
    }

    fn on_simulation_end(&self) {
        self.0.iter().for_each(|o| o.on_simulation_end());
    }
}

/// Reports progress through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver {
    total: AtomicUsize,
    done: AtomicUsize,
    failed: AtomicUsize,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

impl RunObserver for TracingObserver {
    fn on_simulation_start(&self, total: Option<usize>) {
        self.total.store(total.unwrap_or(0), Ordering::SeqCst);
        self.done.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        match total {
            Some(total) => info!("Launching {} simulations", total),
            None => info!("Launching simulations until convergence"),
        }
    }

    fn on_run_start(&self, params: &ParamMap, id: &str) {
        debug!("[{}] start {:?}", id, params);
    }

    fn on_run_end(&self, id: &str, exitcode: i32, elapsed: Duration) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if exitcode != 0 {
            self.failed.fetch_add(1, Ordering::SeqCst);
            warn!("[{}] exited with code {} after {:.2?}", id, exitcode, elapsed);
        }
        match self.total.load(Ordering::SeqCst) {
            0 => debug!("{} simulations done", done),
            total => info!("{}/{} simulations done", done, total),
        }
    }

    fn on_simulation_end(&self) {
        info!(
            "Batch finished: {} runs, {} failed",
            self.completed(),
            self.failed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out() {
        let a = Arc::new(TracingObserver::new());
        let b = Arc::new(TracingObserver::new());
        let mut observers = Observers::new();
        observers.push(a.clone());
        observers.push(b.clone());
        assert_eq!(observers.len(), 2);

        observers.on_simulation_start(Some(2));
        observers.on_run_end("x", 0, Duration::from_millis(5));
        observers.on_run_end("y", 1, Duration::from_millis(5));
        observers.on_simulation_end();

        for o in [a, b] {
            assert_eq!(o.completed(), 2);
            assert_eq!(o.failed(), 1);
        }
    }
}
