//! The poller worker thread.
//!
//! One thread per registry services its handles in turn: resume or issue a read, wait one slice
//! for it, cancel on timeout, deliver whatever completed. Commands from the registry (register,
//! unregister, stop) are checked between handles so a stop request never waits behind more than
//! one wait slice.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PollerConfig;
use crate::diagnostics::threads::{Frame, WorkerGuard, WorkerRegistry};
use crate::error::{Result, WatchError};
use crate::watch::handle::{ReadOutcome, WatchHandle};
use crate::watch::notifier::{ChangeNotifier, EventBatch};
use crate::watch::observer::PollerObserver;
use crate::watch::{WatchKey, WatchSignal};

pub(crate) enum Command {
    Register {
        path: PathBuf,
        reply: Sender<Result<WatchKey>>,
    },
    Unregister {
        key: WatchKey,
        reply: Sender<Result<()>>,
    },
    Stop,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register { path, .. } => f
                .debug_struct("Command::Register")
                .field("path", path)
                .finish(),
            Command::Unregister { key, .. } => f
                .debug_struct("Command::Unregister")
                .field("key", key)
                .finish(),
            Command::Stop => f.write_str("Command::Stop"),
        }
    }
}

/// Counters shared between a poller thread and its registry.
#[derive(Debug, Default)]
pub struct PollerStats {
    issued: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    issue_failures: AtomicU64,
    access_denied: AtomicU64,
    cancel_timeouts: AtomicU64,
    signals_dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerStatsSnapshot {
    pub issued: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub issue_failures: u64,
    pub access_denied: u64,
    pub cancel_timeouts: u64,
    pub signals_dropped: u64,
}

impl PollerStats {
    pub fn snapshot(&self) -> PollerStatsSnapshot {
        PollerStatsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            issue_failures: self.issue_failures.load(Ordering::Relaxed),
            access_denied: self.access_denied.load(Ordering::Relaxed),
            cancel_timeouts: self.cancel_timeouts.load(Ordering::Relaxed),
            signals_dropped: self.signals_dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What the worker reports when it exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub released: usize,
    /// Handles whose outstanding read could not be confirmed cancelled; their directory handles
    /// were leaked instead of closed.
    pub unconfirmed: usize,
}

struct Slot {
    handle: WatchHandle,
    retry_at: Option<Instant>,
}

struct PollerWorker {
    name: String,
    notifier: Arc<dyn ChangeNotifier>,
    observer: Arc<dyn PollerObserver>,
    config: PollerConfig,
    commands: Receiver<Command>,
    signals: Sender<WatchSignal>,
    stats: Arc<PollerStats>,
    slots: Vec<Slot>,
    next_key: u64,
}

impl PollerWorker {
    fn run(mut self, worker: WorkerGuard) -> TeardownReport {
        let _loop_frame = worker.enter(Frame::PollerLoop);
        debug!(target: "dirwatch::poller", worker = %self.name, "poller started");

        loop {
            let command = match self.next_command() {
                Ok(Some(command)) => command,
                Ok(None) => {
                    self.service_round(&worker);
                    continue;
                }
                Err(()) => break,
            };

            match command {
                Command::Register { path, reply } => {
                    let result = self.register(path, &worker);
                    // The caller stopped waiting; a slot it never learned about would only leak.
                    if let Err(crossbeam_channel::SendError(Ok(key))) = reply.send(result) {
                        debug!(target: "dirwatch::poller", worker = %self.name, %key, "registration abandoned by caller");
                        if let Err(err) = self.unregister(key, &worker) {
                            warn!(target: "dirwatch::poller", %key, error = %err, "abandoned registration not released cleanly");
                        }
                    }
                }
                Command::Unregister { key, reply } => {
                    let result = self.unregister(key, &worker);
                    let _ = reply.send(result);
                }
                Command::Stop => break,
            }
        }

        let report = self.teardown(&worker);
        debug!(
            target: "dirwatch::poller",
            worker = %self.name,
            released = report.released,
            unconfirmed = report.unconfirmed,
            "poller stopped"
        );
        report
    }

    /// `Err(())` means the registry is gone and the worker should stop.
    fn next_command(&self) -> std::result::Result<Option<Command>, ()> {
        if let Some(wait) = self.idle_wait() {
            return match self.commands.recv_timeout(wait) {
                Ok(command) => Ok(Some(command)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(()),
            };
        }
        match self.commands.try_recv() {
            Ok(command) => Ok(Some(command)),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Err(()),
        }
    }

    /// How long to block on commands when no handle is ready for service.
    fn idle_wait(&self) -> Option<Duration> {
        if self.slots.is_empty() {
            return Some(self.config.idle_tick);
        }
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        for slot in &self.slots {
            match slot.retry_at {
                Some(at) if at > now => {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
                _ => return None,
            }
        }
        earliest.map(|at| at.saturating_duration_since(now))
    }

    fn register(&mut self, path: PathBuf, worker: &WorkerGuard) -> Result<WatchKey> {
        let key = WatchKey(self.next_key);
        self.next_key += 1;

        let mut handle = WatchHandle::open(
            Arc::clone(&self.notifier),
            Arc::clone(&self.observer),
            key,
            &path,
        )?;

        let issued = {
            let _frame = worker.enter(Frame::IssueRead);
            handle.issue_read().map(|pending| pending.token())
        };
        match issued {
            Ok(token) => {
                PollerStats::bump(&self.stats.issued);
                debug!(target: "dirwatch::poller", %key, %token, path = %path.display(), "registered");
                self.slots.push(Slot {
                    handle,
                    retry_at: None,
                });
                Ok(key)
            }
            Err(reason) => {
                self.count_issue_failure(reason.is_access_denied());
                // Nothing is pending, so the handle closes immediately.
                handle.release(self.config.cancel_timeout, worker)?;
                Err(WatchError::IssueFailed { path, reason })
            }
        }
    }

    fn unregister(&mut self, key: WatchKey, worker: &WorkerGuard) -> Result<()> {
        let Some(idx) = self.slots.iter().position(|s| s.handle.key() == key) else {
            return Err(WatchError::UnknownKey(key.0));
        };
        let slot = self.slots.remove(idx);
        slot.handle.release(self.config.cancel_timeout, worker)
    }

    fn service_round(&mut self, worker: &WorkerGuard) {
        let now = Instant::now();
        for idx in 0..self.slots.len() {
            if self.slots[idx].retry_at.is_some_and(|at| at > now) {
                continue;
            }
            self.service_slot(idx, worker);
            if !self.commands.is_empty() {
                break;
            }
        }
    }

    fn service_slot(&mut self, idx: usize, worker: &WorkerGuard) {
        let wait_slice = self.config.wait_slice;
        let cancel_timeout = self.config.cancel_timeout;
        let backoff = self.config.idle_tick;
        let slot = &mut self.slots[idx];
        slot.retry_at = None;
        let key = slot.handle.key();

        let outcome = if let Some(pending) = slot.handle.in_flight() {
            pending.await_or_cancel(wait_slice, cancel_timeout, worker)
        } else {
            let issued = {
                let _frame = worker.enter(Frame::IssueRead);
                slot.handle.issue_read()
            };
            match issued {
                Ok(pending) => {
                    PollerStats::bump(&self.stats.issued);
                    pending.await_or_cancel(wait_slice, cancel_timeout, worker)
                }
                Err(reason) => {
                    let access_denied = reason.is_access_denied();
                    slot.retry_at = Some(Instant::now() + backoff);
                    let signal = WatchSignal::IssueFailed {
                        key,
                        path: slot.handle.path().to_path_buf(),
                        reason,
                    };
                    self.count_issue_failure(access_denied);
                    self.deliver(signal);
                    return;
                }
            }
        };

        match outcome {
            Ok(ReadOutcome::Completed(batch)) | Ok(ReadOutcome::CompletedDuringCancel(batch)) => {
                PollerStats::bump(&self.stats.completed);
                self.deliver_batch(key, batch);
            }
            Ok(ReadOutcome::Cancelled) => PollerStats::bump(&self.stats.cancelled),
            Err(WatchError::CancelTimeout { .. }) => {
                PollerStats::bump(&self.stats.cancel_timeouts);
                self.deliver(WatchSignal::CancelTimeout { key });
            }
            Err(err) => {
                warn!(target: "dirwatch::poller", %key, error = %err, "unexpected wait failure");
            }
        }
    }

    fn count_issue_failure(&self, access_denied: bool) {
        PollerStats::bump(&self.stats.issue_failures);
        if access_denied {
            PollerStats::bump(&self.stats.access_denied);
        }
    }

    fn deliver_batch(&self, key: WatchKey, batch: EventBatch) {
        if batch.is_empty() {
            return;
        }
        self.deliver(WatchSignal::Events { key, batch });
    }

    fn deliver(&self, signal: WatchSignal) {
        match self.signals.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                PollerStats::bump(&self.stats.signals_dropped);
                debug!(
                    target: "dirwatch::poller",
                    worker = %self.name,
                    capacity = self.config.signal_capacity,
                    "signal channel full; dropping signal"
                );
            }
            // Registry dropped its receiver; nobody is listening.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn teardown(&mut self, worker: &WorkerGuard) -> TeardownReport {
        let _frame = worker.enter(Frame::Teardown);
        let mut report = TeardownReport::default();
        for slot in self.slots.drain(..) {
            let key = slot.handle.key();
            match slot.handle.release(self.config.cancel_timeout, worker) {
                Ok(()) => report.released += 1,
                Err(err) => {
                    warn!(target: "dirwatch::poller", %key, error = %err, "handle not released cleanly");
                    report.unconfirmed += 1;
                }
            }
        }
        report
    }
}

/// Owner-side view of a running poller thread.
pub struct WatchPoller {
    name: String,
    commands: Sender<Command>,
    done: Receiver<TeardownReport>,
    thread: Option<JoinHandle<()>>,
    cancel_timeout: Duration,
}

impl fmt::Debug for WatchPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchPoller")
            .field("name", &self.name)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl WatchPoller {
    pub(crate) fn spawn(
        name: String,
        notifier: Arc<dyn ChangeNotifier>,
        observer: Arc<dyn PollerObserver>,
        config: PollerConfig,
        threads: Arc<WorkerRegistry>,
        signals: Sender<WatchSignal>,
        stats: Arc<PollerStats>,
    ) -> Result<(Self, Sender<Command>)> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (done_tx, done_rx) = bounded(1);

        let worker = PollerWorker {
            name: name.clone(),
            notifier,
            observer,
            config,
            commands: command_rx,
            signals,
            stats,
            slots: Vec::new(),
            next_key: 0,
        };

        let thread_name = name.clone();
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            let guard = threads.attach(thread_name);
            let report = worker.run(guard);
            let _ = done_tx.send(report);
        })?;

        let poller = Self {
            name,
            commands: command_tx.clone(),
            done: done_rx,
            thread: Some(thread),
            cancel_timeout: config.cancel_timeout,
        };
        Ok((poller, command_tx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop and wait at most `bound` for it. A worker that does not answer in
    /// time is detached and reported as unresponsive.
    pub fn stop(&mut self, bound: Duration) -> Result<TeardownReport> {
        let Some(thread) = self.thread.take() else {
            return Ok(TeardownReport::default());
        };

        let _ = self.commands.send(Command::Stop);
        match self.done.recv_timeout(bound) {
            Ok(report) => {
                if thread.join().is_err() {
                    return Err(WatchError::Internal(format!(
                        "poller `{}` panicked during teardown",
                        self.name
                    )));
                }
                if report.unconfirmed > 0 {
                    return Err(WatchError::CancelTimeout {
                        pending: report.unconfirmed,
                        timeout: self.cancel_timeout,
                    });
                }
                info!(
                    target: "dirwatch::poller",
                    worker = %self.name,
                    released = report.released,
                    "poller joined"
                );
                Ok(report)
            }
            Err(_) => {
                warn!(
                    target: "dirwatch::poller",
                    worker = %self.name,
                    waited_ms = bound.as_millis() as u64,
                    "poller unresponsive; detaching thread"
                );
                drop(thread);
                Err(WatchError::PollerUnresponsive {
                    worker: self.name.clone(),
                    waited: bound,
                })
            }
        }
    }
}
