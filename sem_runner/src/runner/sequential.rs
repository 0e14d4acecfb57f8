//! One simulation at a time, in input order.

use super::{deliver, result_channel, run_single, Job, ResultStream, RunContext, Runner};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialRunner;

impl SequentialRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Runner for SequentialRunner {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn run(&self, jobs: Vec<Job>, ctx: Arc<RunContext>) -> ResultStream {
        let (sink, stream) = result_channel();
        tokio::spawn(async move {
            let tx = sink.sender();
            for job in jobs {
                let outcome = run_single(&ctx, job.params).await;
                if !deliver(&tx, &ctx, outcome).await {
                    break;
                }
            }
        });
        stream
    }
}
