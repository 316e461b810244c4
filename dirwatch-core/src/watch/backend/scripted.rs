//! In-memory notifier with fault injection and a protocol log.
//!
//! Used by protocol tests and by dry runs of the stress CLI. Besides scripted failures and delays
//! it records every call it receives, and flags calls that a correct poller never makes (waiting
//! on a request that was never issued, closing under an outstanding request). A wait on an
//! unknown token behaves like the real primitive would: nothing ever signals it, so it sits out
//! its whole timeout.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::watch::notifier::{
    CancelAck, ChangeEvent, ChangeKind, ChangeNotifier, DirHandle, EventBatch, HandleId,
    IssueFailure, OpenFailure, RequestToken, WaitOutcome,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    Opened(HandleId),
    Issued(RequestToken),
    IssueRefused(HandleId, IssueFailure),
    Waited(RequestToken),
    CancelRequested(RequestToken),
    Cancelled(RequestToken),
    Completed(RequestToken),
    Closed(HandleId),
    Violation(String),
}

#[derive(Debug)]
struct Outstanding {
    token: RequestToken,
    issued_at: Instant,
    cancel_confirm_at: Option<Instant>,
}

#[derive(Debug)]
struct HandleState {
    path: PathBuf,
    events: Vec<ChangeEvent>,
    outstanding: Option<Outstanding>,
}

#[derive(Debug, Default)]
struct Inner {
    next_handle: u64,
    next_sequence: u64,
    handles: HashMap<HandleId, HandleState>,
    scripted_failures: VecDeque<IssueFailure>,
    fail_every: Option<u64>,
    issue_attempts: u64,
    completion_delay: Duration,
    cancel_delay: Duration,
    skip_path_checks: bool,
    log: Vec<ProtocolEvent>,
}

impl Inner {
    fn violation(&mut self, message: String) {
        tracing::error!(target: "dirwatch::scripted", %message, "protocol violation");
        self.log.push(ProtocolEvent::Violation(message));
    }
}

#[derive(Default)]
pub struct ScriptedNotifier {
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl fmt::Debug for ScriptedNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ScriptedNotifier");
        match self.inner.try_lock() {
            Some(inner) => debug
                .field("open_handles", &inner.handles.len())
                .field("log_len", &inner.log.len()),
            None => debug.field("inner", &"<locked>"),
        };
        debug.finish()
    }
}

impl ScriptedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept any path without consulting the filesystem.
    pub fn without_path_checks(self) -> Self {
        self.inner.lock().skip_path_checks = true;
        self
    }

    /// Refuse the next `count` issue attempts with `reason`.
    pub fn fail_next_issues(&self, count: usize, reason: IssueFailure) {
        let mut inner = self.inner.lock();
        inner
            .scripted_failures
            .extend(std::iter::repeat_n(reason, count));
    }

    /// Refuse every `period`-th issue attempt with access denied.
    pub fn fail_every(&self, period: u64) {
        self.inner.lock().fail_every = (period > 0).then_some(period);
    }

    /// Reads do not complete until this long after they were issued, even with events queued.
    pub fn set_completion_delay(&self, delay: Duration) {
        self.inner.lock().completion_delay = delay;
    }

    /// Delay between a cancel request and its confirmation.
    pub fn set_cancel_delay(&self, delay: Duration) {
        self.inner.lock().cancel_delay = delay;
    }

    /// Queue a change for every open handle watching an ancestor of `path`.
    pub fn emit(&self, path: impl Into<PathBuf>, kind: ChangeKind) {
        let path = path.into();
        let mut inner = self.inner.lock();
        for state in inner.handles.values_mut() {
            if path.starts_with(&state.path) {
                state.events.push(ChangeEvent {
                    kind,
                    path: path.clone(),
                });
            }
        }
        self.changed.notify_all();
    }

    pub fn protocol_log(&self) -> Vec<ProtocolEvent> {
        self.inner.lock().log.clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.inner
            .lock()
            .log
            .iter()
            .filter_map(|event| match event {
                ProtocolEvent::Violation(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn open_handles(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.inner
            .lock()
            .handles
            .values()
            .filter(|state| state.outstanding.is_some())
            .count()
    }

    fn next_failure(inner: &mut Inner) -> Option<IssueFailure> {
        inner.issue_attempts += 1;
        if let Some(reason) = inner.scripted_failures.pop_front() {
            return Some(reason);
        }
        match inner.fail_every {
            Some(period) if inner.issue_attempts % period == 0 => Some(IssueFailure::AccessDenied),
            _ => None,
        }
    }
}

impl ChangeNotifier for ScriptedNotifier {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn open_directory(&self, path: &Path) -> Result<DirHandle, OpenFailure> {
        let mut inner = self.inner.lock();
        if !inner.skip_path_checks {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(OpenFailure::NotADirectory),
                Err(_) => return Err(OpenFailure::NotFound),
            }
        }

        let id = HandleId(inner.next_handle);
        inner.next_handle += 1;
        inner.handles.insert(
            id,
            HandleState {
                path: path.to_path_buf(),
                events: Vec::new(),
                outstanding: None,
            },
        );
        inner.log.push(ProtocolEvent::Opened(id));
        Ok(DirHandle::new(id, path.to_path_buf()))
    }

    fn issue_read(&self, dir: &DirHandle) -> Result<RequestToken, IssueFailure> {
        let mut inner = self.inner.lock();
        let (path, busy) = match inner.handles.get(&dir.id()) {
            Some(state) => (state.path.clone(), state.outstanding.is_some()),
            None => return Err(IssueFailure::Other(format!("unknown handle {}", dir.id()))),
        };
        if busy {
            inner.violation(format!("issue on {} while a request is outstanding", dir.id()));
            return Err(IssueFailure::Other("request already outstanding".into()));
        }

        let refusal = Self::next_failure(&mut inner).or_else(|| {
            (!inner.skip_path_checks && !path.is_dir()).then_some(IssueFailure::AccessDenied)
        });
        if let Some(reason) = refusal {
            inner
                .log
                .push(ProtocolEvent::IssueRefused(dir.id(), reason.clone()));
            return Err(reason);
        }

        let token = RequestToken::accepted(dir.id(), inner.next_sequence);
        inner.next_sequence += 1;
        if let Some(state) = inner.handles.get_mut(&dir.id()) {
            state.outstanding = Some(Outstanding {
                token,
                issued_at: Instant::now(),
                cancel_confirm_at: None,
            });
        }
        inner.log.push(ProtocolEvent::Issued(token));
        Ok(token)
    }

    fn wait_for_completion(&self, token: &RequestToken, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        inner.log.push(ProtocolEvent::Waited(*token));

        let known = inner
            .handles
            .get(&token.handle())
            .and_then(|state| state.outstanding.as_ref())
            .is_some_and(|outstanding| outstanding.token == *token);
        if !known {
            inner.violation(format!("wait on request {token} that is not outstanding"));
            while Instant::now() < deadline {
                self.changed.wait_until(&mut inner, deadline);
            }
            return WaitOutcome::TimedOut;
        }

        let completion_delay = inner.completion_delay;
        loop {
            let now = Instant::now();
            let Some(state) = inner.handles.get_mut(&token.handle()) else {
                return WaitOutcome::TimedOut;
            };
            let Some(outstanding) = state.outstanding.as_ref() else {
                return WaitOutcome::TimedOut;
            };

            let completes_at = outstanding.issued_at + completion_delay;
            let cancel_at = outstanding.cancel_confirm_at;
            if !state.events.is_empty() && now >= completes_at {
                let batch = EventBatch {
                    events: std::mem::take(&mut state.events),
                };
                state.outstanding = None;
                inner.log.push(ProtocolEvent::Completed(*token));
                return WaitOutcome::Completed(batch);
            }
            if let Some(cancel_at) = cancel_at
                && now >= cancel_at
            {
                state.outstanding = None;
                inner.log.push(ProtocolEvent::Cancelled(*token));
                return WaitOutcome::Cancelled;
            }
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }

            let mut wake = deadline;
            if let Some(cancel_at) = cancel_at {
                wake = wake.min(cancel_at);
            }
            if !state.events.is_empty() {
                wake = wake.min(completes_at);
            }
            self.changed.wait_until(&mut inner, wake);
        }
    }

    fn cancel(&self, token: &RequestToken) -> CancelAck {
        let mut inner = self.inner.lock();
        let confirm_at = Instant::now() + inner.cancel_delay;
        let Some(outstanding) = inner
            .handles
            .get_mut(&token.handle())
            .and_then(|state| state.outstanding.as_mut())
            .filter(|outstanding| outstanding.token == *token)
        else {
            return CancelAck::NotPending;
        };

        outstanding.cancel_confirm_at.get_or_insert(confirm_at);
        inner.log.push(ProtocolEvent::CancelRequested(*token));
        self.changed.notify_all();
        CancelAck::Requested
    }

    fn close(&self, dir: DirHandle) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.handles.remove(&dir.id())
            && let Some(outstanding) = state.outstanding
        {
            inner.violation(format!(
                "close of {} with request {} outstanding",
                dir.id(),
                outstanding.token
            ));
        }
        inner.log.push(ProtocolEvent::Closed(dir.id()));
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_on_an_unknown_token_is_flagged_and_times_out() {
        let notifier = ScriptedNotifier::new().without_path_checks();
        let dir = notifier.open_directory(Path::new("/virtual")).unwrap();
        let bogus = RequestToken::accepted(dir.id(), 99);

        let started = Instant::now();
        let outcome = notifier.wait_for_completion(&bogus, Duration::from_millis(30));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(notifier.violations().len(), 1);
    }

    #[test]
    fn periodic_failures_hit_every_nth_attempt() {
        let notifier = ScriptedNotifier::new().without_path_checks();
        notifier.fail_every(2);
        let dir = notifier.open_directory(Path::new("/virtual")).unwrap();

        let first = notifier.issue_read(&dir).unwrap();
        assert_eq!(notifier.cancel(&first), CancelAck::Requested);
        assert_eq!(
            notifier.wait_for_completion(&first, Duration::from_millis(50)),
            WaitOutcome::Cancelled
        );
        assert_eq!(notifier.issue_read(&dir), Err(IssueFailure::AccessDenied));
        assert!(notifier.issue_read(&dir).is_ok());
    }

    #[test]
    fn delayed_completion_still_yields_to_cancel() {
        let notifier = ScriptedNotifier::new().without_path_checks();
        notifier.set_completion_delay(Duration::from_secs(10));
        let dir = notifier.open_directory(Path::new("/virtual")).unwrap();
        let token = notifier.issue_read(&dir).unwrap();
        notifier.emit("/virtual/file", ChangeKind::Created);

        assert_eq!(
            notifier.wait_for_completion(&token, Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
        notifier.cancel(&token);
        assert_eq!(
            notifier.wait_for_completion(&token, Duration::from_millis(50)),
            WaitOutcome::Cancelled
        );
        notifier.close(dir);
        assert!(notifier.violations().is_empty());
    }
}
