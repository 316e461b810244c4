use std::fmt;

use crate::watch::WatchKey;
use crate::watch::handle::PollerState;
use crate::watch::notifier::{IssueFailure, RequestToken};

/// Observer hook for poller state-machine instrumentation.
pub trait PollerObserver: Send + Sync {
    fn on_transition(&self, _key: WatchKey, _from: PollerState, _to: PollerState) {}

    fn on_issue_failed(&self, _key: WatchKey, _reason: &IssueFailure) {}

    /// Called right before a completion wait, with the token about to be waited on.
    fn on_await(&self, _key: WatchKey, _token: &RequestToken) {}

    fn on_cancel_timeout(&self, _key: WatchKey, _token: &RequestToken) {}
}

/// No-op observer used when nothing is listening.
pub struct NoopPollerObserver;

impl PollerObserver for NoopPollerObserver {}

impl fmt::Debug for NoopPollerObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NoopPollerObserver")
    }
}
