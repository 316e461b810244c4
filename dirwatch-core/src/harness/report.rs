//! Run counters, verdict and the final report.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Sequential,
    Concurrent,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Sequential => f.write_str("sequential"),
            RunMode::Concurrent => f.write_str("concurrent"),
        }
    }
}

/// Shared, thread-safe counters updated by every driver of a run.
#[derive(Debug, Default)]
pub struct RunCounters {
    iterations: AtomicU64,
    churn_iterations: AtomicU64,
    access_denied: AtomicU64,
    open_failures: AtomicU64,
    other_issue_failures: AtomicU64,
    mutation_errors: AtomicU64,
    cancel_timeouts: AtomicU64,
    unresponsive_closes: AtomicU64,
    cleanup_failures: AtomicU64,
    oracle_samples: AtomicU64,
}

impl RunCounters {
    /// A registrar (or sequential) iteration finished.
    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// A churner delete/recreate pass finished.
    pub fn record_churn(&self) {
        self.churn_iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the accumulated access-denied count, including this one.
    pub fn record_access_denied(&self) -> u64 {
        self.access_denied.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_issue_failure(&self) {
        self.other_issue_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mutation_error(&self) {
        self.mutation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel_timeouts(&self, count: u64) {
        self.cancel_timeouts.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_unresponsive_close(&self) {
        self.unresponsive_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup_failure(&self) {
        self.cleanup_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oracle_samples(&self, count: u64) {
        self.oracle_samples.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunStats {
        RunStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            churn_iterations: self.churn_iterations.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            other_issue_failures: self.other_issue_failures.load(Ordering::Relaxed),
            mutation_errors: self.mutation_errors.load(Ordering::Relaxed),
            cancel_timeouts: self.cancel_timeouts.load(Ordering::Relaxed),
            unresponsive_closes: self.unresponsive_closes.load(Ordering::Relaxed),
            cleanup_failures: self.cleanup_failures.load(Ordering::Relaxed),
            oracle_samples: self.oracle_samples.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Registrar iterations; comparable to the planned iteration count.
    pub iterations: u64,
    /// Delete/recreate passes of the concurrent churner. Always zero in sequential mode.
    pub churn_iterations: u64,
    /// Iterations in which at least one access denied was observed.
    pub access_denied: u64,
    /// Registrations that could not open the directory (it was gone at the time).
    pub open_failures: u64,
    pub other_issue_failures: u64,
    pub mutation_errors: u64,
    pub cancel_timeouts: u64,
    pub unresponsive_closes: u64,
    pub cleanup_failures: u64,
    pub oracle_samples: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    HangConfirmed {
        iteration: usize,
        access_denied: u64,
        workers: Vec<String>,
    },
    DeadlineExceeded {
        deadline_ms: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The race was provoked at least once and never hung the poller.
    Passed,
    /// The race was never provoked, so the run proves nothing.
    Inconclusive,
    Failed { cause: FailureCause },
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Passed => 0,
            Verdict::Failed { .. } => 1,
            Verdict::Inconclusive => 2,
        }
    }

    /// Outcome for a run that finished without failing.
    pub fn from_access_denied(access_denied: u64) -> Self {
        if access_denied > 0 {
            Verdict::Passed
        } else {
            Verdict::Inconclusive
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    pub backend: String,
    pub planned_iterations: usize,
    pub stats: RunStats,
    pub verdict: Verdict,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        match &self.verdict {
            Verdict::Passed => format!(
                "passed: 'Access is denied' errors count: [{}]",
                self.stats.access_denied
            ),
            Verdict::Inconclusive => {
                "inconclusive: cannot reproduce 'Access is denied' error".to_string()
            }
            Verdict::Failed {
                cause:
                    FailureCause::HangConfirmed {
                        iteration,
                        access_denied,
                        workers,
                    },
            } => format!(
                "failed: poller thread hangs in completion wait on iteration: [{iteration}], \
                 'Access is denied' errors count: [{access_denied}], workers: {workers:?}"
            ),
            Verdict::Failed {
                cause: FailureCause::DeadlineExceeded { deadline_ms },
            } => format!(
                "failed: run exceeded its {deadline_ms} ms deadline after {} of {} iterations, \
                 'Access is denied' errors count: [{}]",
                self.stats.iterations, self.planned_iterations, self.stats.access_denied
            ),
        }
    }
}
