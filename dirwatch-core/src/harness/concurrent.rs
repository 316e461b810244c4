//! Concurrent churn: a registrar driver opens, registers and closes registries on a shared
//! directory while a churner driver keeps deleting and recreating it.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::Result;
use crate::harness::report::RunCounters;
use crate::harness::{RunEnd, StressHarness, log_progress};
use crate::mutator::DirectoryMutator;

const REGISTRAR: &str = "dirwatch-registrar";
const CHURNER: &str = "dirwatch-churner";

pub(crate) fn run(
    harness: &StressHarness,
    root: &Path,
    counters: &Arc<RunCounters>,
) -> Result<RunEnd> {
    let deadline = Instant::now() + harness.config().deadline;
    let iterations = harness.config().iterations;
    let mut pool = harness.pool();

    let registrar = harness.clone();
    let mutator = DirectoryMutator::new(root);
    let shared = Arc::clone(counters);
    pool.spawn(REGISTRAR, move |ctx| {
        for iteration in 0..iterations {
            if ctx.is_cancelled() {
                break;
            }
            log_progress(&ctx.name, iteration, iterations);
            registrar.watch_iteration(iteration, &mutator, false, &shared)?;
        }
        Ok(())
    })?;

    let mutator = DirectoryMutator::new(root);
    let shared = Arc::clone(counters);
    pool.spawn(CHURNER, move |ctx| {
        for iteration in 0..iterations {
            if ctx.is_cancelled() {
                break;
            }
            if let Err(err) = mutator.recreate() {
                shared.record_mutation_error();
                debug!(target: "dirwatch::mutator", iteration, error = %err, "recreate failed");
            }
            shared.record_churn();
        }
        Ok(())
    })?;

    let outcome = pool.join_until(deadline, harness.grace());
    harness.conclude(outcome)
}
