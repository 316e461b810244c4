//! Stress harness: provoke the delete/recreate race against live registries and decide whether
//! the poller ever wedged.
//!
//! Both modes run their drivers in a [`DriverPool`] gated by the run deadline, share one
//! [`WorkerRegistry`] that every poller publishes its frames into, and consult the
//! [`HangOracle`] whenever an iteration saw access denied.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StressConfig;
use crate::diagnostics::oracle::{HangOracle, HangVerdict};
use crate::diagnostics::threads::{ThreadRegistry, WorkerRegistry};
use crate::error::{Result, WatchError};
use crate::mutator::DirectoryMutator;
use crate::watch::WatchSignal;
use crate::watch::notifier::ChangeNotifier;
use crate::watch::registry::WatchRegistry;

pub mod concurrent;
pub mod pool;
pub mod report;
pub mod scratch;
pub mod sequential;

pub use pool::{DriverContext, DriverPool, PoolOutcome};
pub use report::{FailureCause, RunCounters, RunMode, RunReport, RunStats, Verdict};
pub use scratch::ScratchDir;

/// Log an info-level progress line every this many iterations.
const PROGRESS_EVERY: usize = 128;

/// How a run's drivers ended, before it is turned into a [`Verdict`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RunEnd {
    Completed,
    /// Cancelled from outside before every iteration ran.
    Interrupted,
    Failed(FailureCause),
}

#[derive(Clone)]
pub struct StressHarness {
    notifier: Arc<dyn ChangeNotifier>,
    threads: Arc<WorkerRegistry>,
    thread_source: Arc<dyn ThreadRegistry>,
    oracle: HangOracle,
    config: StressConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for StressHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressHarness")
            .field("backend", &self.notifier.name())
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl StressHarness {
    pub fn new(notifier: Arc<dyn ChangeNotifier>, config: StressConfig) -> Self {
        let threads = Arc::new(WorkerRegistry::new());
        Self {
            notifier,
            thread_source: Arc::clone(&threads) as Arc<dyn ThreadRegistry>,
            threads,
            oracle: HangOracle::new(config.oracle),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run early when `cancel` fires. An interrupted run is never reported as passed.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sample a different stack source than the pollers' own worker registry.
    pub fn with_thread_registry(mut self, thread_source: Arc<dyn ThreadRegistry>) -> Self {
        self.thread_source = thread_source;
        self
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    pub fn worker_registry(&self) -> &Arc<WorkerRegistry> {
        &self.threads
    }

    /// Run in a fresh scratch directory under `base` (or the system temp dir). The scratch
    /// directory is removed on every exit path.
    pub fn run(&self, mode: RunMode, base: Option<&Path>) -> Result<RunReport> {
        let scratch = ScratchDir::create(base)?;
        let counters = Arc::new(RunCounters::default());
        let report = self.run_in(mode, scratch.watched(), &counters);
        scratch.cleanup(&counters);
        let mut report = report?;
        report.stats = counters.snapshot();
        Ok(report)
    }

    /// Run against `root`, which is deleted and recreated freely.
    pub fn run_in(
        &self,
        mode: RunMode,
        root: &Path,
        counters: &Arc<RunCounters>,
    ) -> Result<RunReport> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            target: "dirwatch::harness",
            run = %run_id,
            %mode,
            backend = self.notifier.name(),
            iterations = self.config.iterations,
            deadline_secs = self.config.deadline.as_secs(),
            root = %root.display(),
            "stress run started"
        );

        let end = match mode {
            RunMode::Sequential => sequential::run(self, root, counters)?,
            RunMode::Concurrent => concurrent::run(self, root, counters)?,
        };

        let stats = counters.snapshot();
        let verdict = match end {
            RunEnd::Completed => Verdict::from_access_denied(stats.access_denied),
            RunEnd::Interrupted => Verdict::Inconclusive,
            RunEnd::Failed(cause) => Verdict::Failed { cause },
        };
        let report = RunReport {
            run_id,
            started_at,
            mode,
            backend: self.notifier.name().to_string(),
            planned_iterations: self.config.iterations,
            stats,
            verdict,
            elapsed_ms: clock.elapsed().as_millis() as u64,
        };
        info!(target: "dirwatch::harness", run = %run_id, summary = %report.summary(), "stress run finished");
        Ok(report)
    }

    /// One registrar iteration: open a registry, register `root`, optionally churn it, give the
    /// poller the settle window, check for a hang if access denied was seen, close.
    pub(crate) fn watch_iteration(
        &self,
        iteration: usize,
        mutator: &DirectoryMutator,
        mutate: bool,
        counters: &RunCounters,
    ) -> Result<()> {
        let registry = WatchRegistry::open(
            Arc::clone(&self.notifier),
            Arc::clone(&self.threads),
            self.config.poller,
        )?;
        let mut access_denied = false;

        if let Err(err) = mutator.ensure_root() {
            counters.record_mutation_error();
            debug!(target: "dirwatch::harness", iteration, error = %err, "could not create watched directory");
        }
        match registry.register(mutator.root()) {
            Ok(key) => debug!(target: "dirwatch::harness", iteration, %key, "registered"),
            Err(err) if err.is_access_denied() => {
                debug!(target: "dirwatch::harness", iteration, "access denied at registration");
                access_denied = true;
            }
            Err(WatchError::Open { reason, .. }) => {
                counters.record_open_failure();
                debug!(target: "dirwatch::harness", iteration, %reason, "watched directory could not be opened");
            }
            Err(err) => {
                counters.record_issue_failure();
                debug!(target: "dirwatch::harness", iteration, error = %err, "registration failed");
            }
        }

        if mutate && let Err(err) = mutator.recreate() {
            counters.record_mutation_error();
            debug!(target: "dirwatch::harness", iteration, error = %err, "recreate failed");
        }
        access_denied |= self.settle(&registry, counters);

        let hang = if access_denied {
            let total = counters.record_access_denied();
            self.check_hang(iteration, total, counters)
        } else {
            None
        };

        close_registry(&registry, counters);
        counters.record_iteration();
        match hang {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn settle(&self, registry: &WatchRegistry, counters: &RunCounters) -> bool {
        let until = Instant::now() + self.config.settle;
        let mut access_denied = false;
        loop {
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let Some(signal) = registry.poll_signal(left) else {
                break;
            };
            match signal {
                WatchSignal::IssueFailed { ref reason, .. } if reason.is_access_denied() => {
                    access_denied = true;
                    break;
                }
                WatchSignal::IssueFailed { .. } => counters.record_issue_failure(),
                WatchSignal::CancelTimeout { .. } => counters.record_cancel_timeouts(1),
                WatchSignal::Events { .. } => {}
            }
        }
        access_denied
    }

    fn check_hang(
        &self,
        iteration: usize,
        access_denied: u64,
        counters: &RunCounters,
    ) -> Option<WatchError> {
        let verdict = self.oracle.confirm(self.thread_source.as_ref());
        counters.record_oracle_samples(match verdict {
            HangVerdict::Clear => 1,
            HangVerdict::Transient | HangVerdict::Hung { .. } => 2,
        });
        match verdict {
            HangVerdict::Hung { workers } => Some(WatchError::HangConfirmed {
                iteration,
                access_denied,
                workers,
            }),
            HangVerdict::Transient => {
                debug!(target: "dirwatch::harness", iteration, "stall cleared during cooldown");
                None
            }
            HangVerdict::Clear => None,
        }
    }

    /// Grace period drivers get after the deadline to notice cancellation.
    pub(crate) fn grace(&self) -> Duration {
        self.config.poller.close_bound() + self.config.settle
    }

    pub(crate) fn pool(&self) -> DriverPool {
        DriverPool::new(Arc::clone(&self.threads), self.cancel.child_token())
    }

    pub(crate) fn conclude(&self, outcome: PoolOutcome) -> Result<RunEnd> {
        let mut hang = None;
        let mut fatal = None;
        for (driver, result) in outcome.finished {
            match result {
                Ok(()) => {}
                Err(WatchError::HangConfirmed {
                    iteration,
                    access_denied,
                    workers,
                }) => {
                    hang.get_or_insert(FailureCause::HangConfirmed {
                        iteration,
                        access_denied,
                        workers,
                    });
                }
                Err(err) => {
                    warn!(target: "dirwatch::harness", %driver, error = %err, "driver aborted");
                    fatal.get_or_insert(err);
                }
            }
        }

        if let Some(cause) = hang {
            return Ok(RunEnd::Failed(cause));
        }
        if outcome.deadline_hit {
            return Ok(RunEnd::Failed(FailureCause::DeadlineExceeded {
                deadline_ms: self.config.deadline.as_millis() as u64,
            }));
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Ok(RunEnd::Interrupted);
        }
        Ok(RunEnd::Completed)
    }
}

pub(crate) fn log_progress(driver: &str, iteration: usize, total: usize) {
    debug!(target: "dirwatch::harness", %driver, "Iteration: [{iteration}] of [{total}]");
    if iteration % PROGRESS_EVERY == 0 {
        info!(target: "dirwatch::harness", %driver, iteration, total, "progress");
    }
}

fn close_registry(registry: &WatchRegistry, counters: &RunCounters) {
    match registry.close() {
        Ok(()) => {}
        Err(WatchError::PollerUnresponsive { worker, waited }) => {
            counters.record_unresponsive_close();
            warn!(target: "dirwatch::harness", %worker, waited_ms = waited.as_millis() as u64, "poller did not stop in time");
        }
        Err(WatchError::CancelTimeout { pending, .. }) => {
            counters.record_cancel_timeouts(pending as u64);
        }
        Err(err) => {
            counters.record_cleanup_failure();
            warn!(target: "dirwatch::harness", error = %err, "registry close failed");
        }
    }
}
