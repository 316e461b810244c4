//! One registered directory and its request lifecycle.
//!
//! The wait step is only reachable through a [`PendingRead`], which [`WatchHandle::issue_read`]
//! returns only when the notifier accepted the read. A failed issue yields no `PendingRead`, so
//! there is nothing to wait on.
//!
//! Access denied means the directory under the handle was deleted or replaced. The directory
//! handle is then closed (nothing is pending on it) and the path is reopened by the next issue,
//! so a directory that comes back is watched again without re-registering.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::diagnostics::threads::{Frame, WorkerGuard};
use crate::error::{Result, WatchError};
use crate::watch::WatchKey;
use crate::watch::notifier::{
    CancelAck, ChangeNotifier, DirHandle, EventBatch, IssueFailure, OpenFailure, RequestToken,
    WaitOutcome,
};
use crate::watch::observer::PollerObserver;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PollerState {
    Idle,
    Issuing,
    Waiting,
    Completed,
    Cancelled,
    IssueFailed,
    Stopped,
}

/// How a pending read ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Completed(EventBatch),
    Cancelled,
    /// The read completed while its cancellation was in flight.
    CompletedDuringCancel(EventBatch),
}

impl ReadOutcome {
    pub fn into_batch(self) -> Option<EventBatch> {
        match self {
            ReadOutcome::Completed(batch) | ReadOutcome::CompletedDuringCancel(batch) => {
                Some(batch)
            }
            ReadOutcome::Cancelled => None,
        }
    }
}

pub struct WatchHandle {
    key: WatchKey,
    path: PathBuf,
    dir: Option<DirHandle>,
    pending: Option<RequestToken>,
    state: PollerState,
    notifier: Arc<dyn ChangeNotifier>,
    observer: Arc<dyn PollerObserver>,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("dir", &self.dir.as_ref().map(DirHandle::id))
            .field("pending", &self.pending)
            .field("state", &self.state)
            .field("notifier", &self.notifier.name())
            .finish()
    }
}

impl WatchHandle {
    pub fn open(
        notifier: Arc<dyn ChangeNotifier>,
        observer: Arc<dyn PollerObserver>,
        key: WatchKey,
        path: &Path,
    ) -> Result<Self> {
        let dir = notifier
            .open_directory(path)
            .map_err(|reason| WatchError::Open {
                path: path.to_path_buf(),
                reason,
            })?;

        Ok(Self {
            key,
            path: path.to_path_buf(),
            dir: Some(dir),
            pending: None,
            state: PollerState::Idle,
            notifier,
            observer,
        })
    }

    pub fn key(&self) -> WatchKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn pending_request(&self) -> Option<RequestToken> {
        self.pending
    }

    /// Whether a directory handle is currently open. False after an access denied until the
    /// next issue manages to reopen the path.
    pub fn is_open(&self) -> bool {
        self.dir.is_some()
    }

    /// Start an asynchronous read. On failure nothing is left pending and the handle is `Idle`,
    /// ready for another attempt.
    pub fn issue_read(&mut self) -> std::result::Result<PendingRead<'_>, IssueFailure> {
        if let Some(token) = self.pending {
            return Err(IssueFailure::Other(format!(
                "request {token} is still outstanding"
            )));
        }

        self.transition(PollerState::Issuing);
        let issued = self.reopen_if_discarded().and_then(|()| match self.dir.as_ref() {
            Some(dir) => self.notifier.issue_read(dir),
            None => Err(IssueFailure::Other("handle is closed".into())),
        });

        match issued {
            Ok(token) => {
                self.pending = Some(token);
                self.transition(PollerState::Waiting);
                Ok(PendingRead {
                    handle: self,
                    token,
                })
            }
            Err(reason) => {
                debug!(
                    target: "dirwatch::poller",
                    key = %self.key,
                    path = %self.path.display(),
                    %reason,
                    "issue refused"
                );
                if reason.is_access_denied() {
                    self.discard_dir();
                }
                self.transition(PollerState::IssueFailed);
                self.observer.on_issue_failed(self.key, &reason);
                self.transition(PollerState::Idle);
                Err(reason)
            }
        }
    }

    /// Resume waiting on a read that is already outstanding, for example the first read issued
    /// at registration or one whose cancellation was not confirmed in time.
    pub fn in_flight(&mut self) -> Option<PendingRead<'_>> {
        let token = self.pending?;
        Some(PendingRead {
            handle: self,
            token,
        })
    }

    /// Cancel whatever is outstanding, then close the directory handle. If the cancellation is
    /// not confirmed the directory handle is leaked rather than closed under a live request.
    pub fn release(mut self, cancel_timeout: Duration, worker: &WorkerGuard) -> Result<()> {
        if self.pending.is_some() {
            self.cancel_pending(cancel_timeout, worker)?;
        }
        self.close_dir();
        Ok(())
    }

    /// Cancel the outstanding read, if any, and wait up to `cancel_timeout` for confirmation.
    pub fn cancel_pending(
        &mut self,
        cancel_timeout: Duration,
        worker: &WorkerGuard,
    ) -> Result<ReadOutcome> {
        let Some(token) = self.pending else {
            return Ok(ReadOutcome::Cancelled);
        };

        match self.notifier.cancel(&token) {
            CancelAck::Requested => self.confirm_cancel(token, cancel_timeout, worker),
            CancelAck::NotPending => {
                self.pending = None;
                self.transition(PollerState::Cancelled);
                self.transition(PollerState::Idle);
                Ok(ReadOutcome::Cancelled)
            }
        }
    }

    fn confirm_cancel(
        &mut self,
        token: RequestToken,
        cancel_timeout: Duration,
        worker: &WorkerGuard,
    ) -> Result<ReadOutcome> {
        self.observer.on_await(self.key, &token);
        let confirmation = {
            let _frame = worker.enter(Frame::AwaitCompletion);
            self.notifier.wait_for_completion(&token, cancel_timeout)
        };

        match confirmation {
            WaitOutcome::Cancelled => {
                self.pending = None;
                self.transition(PollerState::Cancelled);
                self.transition(PollerState::Idle);
                Ok(ReadOutcome::Cancelled)
            }
            WaitOutcome::Completed(batch) => {
                self.pending = None;
                self.transition(PollerState::Completed);
                self.transition(PollerState::Idle);
                Ok(ReadOutcome::CompletedDuringCancel(batch))
            }
            WaitOutcome::TimedOut => {
                warn!(
                    target: "dirwatch::poller",
                    key = %self.key,
                    %token,
                    timeout_ms = cancel_timeout.as_millis() as u64,
                    "cancellation not confirmed"
                );
                self.observer.on_cancel_timeout(self.key, &token);
                Err(WatchError::CancelTimeout {
                    pending: 1,
                    timeout: cancel_timeout,
                })
            }
        }
    }

    fn reopen_if_discarded(&mut self) -> std::result::Result<(), IssueFailure> {
        if self.dir.is_some() {
            return Ok(());
        }
        match self.notifier.open_directory(&self.path) {
            Ok(dir) => {
                debug!(
                    target: "dirwatch::poller",
                    key = %self.key,
                    handle = %dir.id(),
                    "directory reopened"
                );
                self.dir = Some(dir);
                Ok(())
            }
            // Still gone, or replaced by something else: keep reporting the churn.
            Err(OpenFailure::NotFound | OpenFailure::NotADirectory | OpenFailure::AccessDenied) => {
                Err(IssueFailure::AccessDenied)
            }
            Err(OpenFailure::Other(msg)) => Err(IssueFailure::Other(msg)),
        }
    }

    /// Close the directory handle without stopping the watch. Only valid with nothing pending.
    fn discard_dir(&mut self) {
        debug_assert!(self.pending.is_none());
        if let Some(dir) = self.dir.take() {
            self.notifier.close(dir);
        }
    }

    fn close_dir(&mut self) {
        if let Some(dir) = self.dir.take() {
            self.notifier.close(dir);
            self.transition(PollerState::Stopped);
        }
    }

    fn transition(&mut self, to: PollerState) {
        let from = self.state;
        if from != to {
            self.state = to;
            self.observer.on_transition(self.key, from, to);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(token) = self.pending {
            // The notifier may still complete into this handle; never close under it.
            if self.dir.take().is_some() {
                warn!(
                    target: "dirwatch::poller",
                    key = %self.key,
                    %token,
                    "leaking directory handle with an unconfirmed request"
                );
            }
            return;
        }
        self.close_dir();
    }
}

/// Proof that a read was accepted. Borrowing the handle mutably keeps any other issue from
/// interleaving before this one is resolved.
pub struct PendingRead<'a> {
    handle: &'a mut WatchHandle,
    token: RequestToken,
}

impl fmt::Debug for PendingRead<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRead")
            .field("key", &self.handle.key)
            .field("token", &self.token)
            .finish()
    }
}

impl PendingRead<'_> {
    pub fn token(&self) -> RequestToken {
        self.token
    }

    /// Wait up to `timeout` for the read; on timeout cancel it and wait up to `cancel_timeout`
    /// for the cancellation to be confirmed.
    pub fn await_or_cancel(
        self,
        timeout: Duration,
        cancel_timeout: Duration,
        worker: &WorkerGuard,
    ) -> Result<ReadOutcome> {
        let PendingRead { handle, token } = self;

        handle.observer.on_await(handle.key, &token);
        let outcome = {
            let _frame = worker.enter(Frame::AwaitCompletion);
            handle.notifier.wait_for_completion(&token, timeout)
        };

        match outcome {
            WaitOutcome::Completed(batch) => {
                handle.pending = None;
                handle.transition(PollerState::Completed);
                handle.transition(PollerState::Idle);
                Ok(ReadOutcome::Completed(batch))
            }
            WaitOutcome::Cancelled => {
                handle.pending = None;
                handle.transition(PollerState::Cancelled);
                handle.transition(PollerState::Idle);
                Ok(ReadOutcome::Cancelled)
            }
            WaitOutcome::TimedOut => handle.cancel_pending(cancel_timeout, worker),
        }
    }
}
