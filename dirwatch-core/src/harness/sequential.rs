//! Sequential churn: one driver registers, deletes and recreates the same directory in turn.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::harness::report::RunCounters;
use crate::harness::{RunEnd, StressHarness, log_progress};
use crate::mutator::DirectoryMutator;

const DRIVER: &str = "dirwatch-sequential";

pub(crate) fn run(
    harness: &StressHarness,
    root: &Path,
    counters: &Arc<RunCounters>,
) -> Result<RunEnd> {
    let deadline = Instant::now() + harness.config().deadline;
    let iterations = harness.config().iterations;
    let mut pool = harness.pool();

    let driver = harness.clone();
    let mutator = DirectoryMutator::new(root);
    let shared = Arc::clone(counters);
    pool.spawn(DRIVER, move |ctx| {
        for iteration in 0..iterations {
            if ctx.is_cancelled() {
                break;
            }
            log_progress(&ctx.name, iteration, iterations);
            driver.watch_iteration(iteration, &mutator, true, &shared)?;
        }
        Ok(())
    })?;

    let outcome = pool.join_until(deadline, harness.grace());
    harness.conclude(outcome)
}
