//! Driver threads with structured shutdown.
//!
//! All drivers share one [`CancellationToken`]. The pool has a single deadline gate: when it
//! passes, the token is cancelled, drivers get a grace period to notice, and whoever is still
//! running after that is detached instead of joined.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::diagnostics::threads::{Frame, WorkerRegistry};
use crate::error::{Result, WatchError};

/// What a driver closure gets to work with.
#[derive(Debug, Clone)]
pub struct DriverContext {
    pub name: String,
    pub cancel: CancellationToken,
}

impl DriverContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug)]
struct DriverExit {
    name: String,
    result: Result<()>,
}

/// How the pool's drivers ended.
#[derive(Debug, Default)]
pub struct PoolOutcome {
    /// Driver results in completion order.
    pub finished: Vec<(String, Result<()>)>,
    /// Drivers still running when the grace period after the deadline ran out.
    pub detached: Vec<String>,
    pub deadline_hit: bool,
}

impl PoolOutcome {
    /// First driver error, if any.
    pub fn first_error(&self) -> Option<&WatchError> {
        self.finished.iter().find_map(|(_, r)| r.as_ref().err())
    }
}

pub struct DriverPool {
    threads: Arc<WorkerRegistry>,
    cancel: CancellationToken,
    done_tx: Sender<DriverExit>,
    done_rx: Receiver<DriverExit>,
    drivers: Vec<(String, JoinHandle<()>)>,
}

impl fmt::Debug for DriverPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.drivers.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("DriverPool")
            .field("drivers", &names)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl DriverPool {
    pub fn new(threads: Arc<WorkerRegistry>, cancel: CancellationToken) -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            threads,
            cancel,
            done_tx,
            done_rx,
            drivers: Vec::new(),
        }
    }

    /// Start a named driver thread. The driver is visible in the worker registry under `name`
    /// for as long as it runs.
    pub fn spawn<F>(&mut self, name: impl Into<String>, driver: F) -> Result<()>
    where
        F: FnOnce(DriverContext) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let ctx = DriverContext {
            name: name.clone(),
            cancel: self.cancel.clone(),
        };
        let threads = Arc::clone(&self.threads);
        let done = self.done_tx.clone();
        let thread_name = name.clone();

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let worker = threads.attach(thread_name.clone());
            let result = {
                let _frame = worker.enter(Frame::Driver);
                panic::catch_unwind(AssertUnwindSafe(|| driver(ctx))).unwrap_or_else(|_| {
                    Err(WatchError::Internal(format!("driver `{thread_name}` panicked")))
                })
            };
            drop(worker);
            let _ = done.send(DriverExit {
                name: thread_name,
                result,
            });
        })?;

        self.drivers.push((name, handle));
        Ok(())
    }

    /// Wait for every driver, but no longer than `deadline` plus `grace`. The first driver error
    /// cancels the rest.
    pub fn join_until(mut self, deadline: Instant, grace: Duration) -> PoolOutcome {
        let mut outcome = PoolOutcome::default();
        let mut remaining = self.drivers.len();
        let mut gate = deadline;

        while remaining > 0 {
            match self.done_rx.recv_deadline(gate) {
                Ok(exit) => {
                    remaining -= 1;
                    if let Err(err) = &exit.result {
                        debug!(target: "dirwatch::harness", driver = %exit.name, error = %err, "driver failed; cancelling the others");
                        self.cancel.cancel();
                    }
                    outcome.finished.push((exit.name, exit.result));
                }
                Err(RecvTimeoutError::Timeout) if !outcome.deadline_hit => {
                    warn!(
                        target: "dirwatch::harness",
                        remaining,
                        "run deadline reached; cancelling drivers"
                    );
                    outcome.deadline_hit = true;
                    self.cancel.cancel();
                    gate = Instant::now() + grace;
                }
                Err(_) => break,
            }
        }

        let finished: Vec<&str> = outcome.finished.iter().map(|(n, _)| n.as_str()).collect();
        for (name, handle) in self.drivers.drain(..) {
            if finished.contains(&name.as_str()) {
                let _ = handle.join();
            } else {
                warn!(target: "dirwatch::harness", driver = %name, "driver did not stop; detaching");
                outcome.detached.push(name);
            }
        }
        outcome
    }
}
