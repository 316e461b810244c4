//! Client-facing watch registry.
//!
//! Every registry owns exactly one poller thread. Registration, unregistration and close are
//! forwarded to that thread as commands; the registry itself never touches a directory handle.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PollerConfig;
use crate::diagnostics::threads::WorkerRegistry;
use crate::error::{Result, WatchError};
use crate::watch::notifier::ChangeNotifier;
use crate::watch::observer::{NoopPollerObserver, PollerObserver};
use crate::watch::poller::{Command, PollerStats, PollerStatsSnapshot, WatchPoller};
use crate::watch::{WatchKey, WatchSignal};

pub struct WatchRegistry {
    id: Uuid,
    config: PollerConfig,
    commands: Sender<Command>,
    signals: Receiver<WatchSignal>,
    stats: Arc<PollerStats>,
    poller: Mutex<Option<WatchPoller>>,
    closed: AtomicBool,
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl WatchRegistry {
    /// Open a registry and start its poller thread.
    pub fn open(
        notifier: Arc<dyn ChangeNotifier>,
        threads: Arc<WorkerRegistry>,
        config: PollerConfig,
    ) -> Result<Self> {
        Self::with_observer(notifier, threads, config, Arc::new(NoopPollerObserver))
    }

    pub fn with_observer(
        notifier: Arc<dyn ChangeNotifier>,
        threads: Arc<WorkerRegistry>,
        config: PollerConfig,
        observer: Arc<dyn PollerObserver>,
    ) -> Result<Self> {
        let id = Uuid::now_v7();
        let (signal_tx, signal_rx) = bounded(config.signal_capacity);
        let stats = Arc::new(PollerStats::default());
        let name = format!("dirwatch-poller-{}", &id.simple().to_string()[..8]);

        let backend = notifier.name();
        let (poller, commands) = WatchPoller::spawn(
            name,
            notifier,
            observer,
            config,
            threads,
            signal_tx,
            Arc::clone(&stats),
        )?;
        debug!(target: "dirwatch::registry", registry = %id, poller = poller.name(), backend, "registry opened");

        Ok(Self {
            id,
            config,
            commands,
            signals: signal_rx,
            stats,
            poller: Mutex::new(Some(poller)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register `path`. The poller opens the directory and issues its first read before
    /// answering, so a transient access denied surfaces here as [`WatchError::IssueFailed`].
    /// If no answer arrives within [`PollerConfig::close_bound`] this returns
    /// [`WatchError::PollerUnresponsive`] and the poller releases the directory once it gets to it.
    pub fn register(&self, path: impl AsRef<Path>) -> Result<WatchKey> {
        let (reply, answer) = bounded(1);
        self.send(Command::Register {
            path: path.as_ref().to_path_buf(),
            reply,
        })?;
        self.await_reply(&answer)?
    }

    pub fn unregister(&self, key: WatchKey) -> Result<()> {
        let (reply, answer) = bounded(1);
        self.send(Command::Unregister { key, reply })?;
        self.await_reply(&answer)?
    }

    /// Next signal from the poller, waiting at most `timeout`.
    pub fn poll_signal(&self, timeout: Duration) -> Option<WatchSignal> {
        self.signals.recv_timeout(timeout).ok()
    }

    pub fn drain_signals(&self) -> Vec<WatchSignal> {
        self.signals.try_iter().collect()
    }

    pub fn stats(&self) -> PollerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the poller. Every outstanding read is cancelled before the worker exits. Returns
    /// within [`PollerConfig::close_bound`]; later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(mut poller) = self.poller.lock().take() else {
            return Ok(());
        };

        let report = poller.stop(self.config.close_bound())?;
        info!(
            target: "dirwatch::registry",
            registry = %self.id,
            released = report.released,
            "registry closed"
        );
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.is_closed() {
            return Err(WatchError::RegistryClosed);
        }
        self.commands
            .send(command)
            .map_err(|_| WatchError::RegistryClosed)
    }

    fn await_reply<T>(&self, answer: &Receiver<T>) -> Result<T> {
        // The worker answers between handles, so it may first finish one wait slice and one
        // bounded cancellation.
        let bound = self.config.close_bound();
        match answer.recv_timeout(bound) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(WatchError::PollerUnresponsive {
                worker: self.poller_name(),
                waited: bound,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(WatchError::RegistryClosed),
        }
    }

    fn poller_name(&self) -> String {
        self.poller
            .lock()
            .as_ref()
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| format!("dirwatch-poller-{}", self.id))
    }
}

impl Drop for WatchRegistry {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(target: "dirwatch::registry", registry = %self.id, error = %err, "close on drop failed");
        }
    }
}
