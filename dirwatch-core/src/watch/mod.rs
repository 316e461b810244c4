//! Directory watch registry and its background poller.
//!
//! A [`WatchRegistry`](registry::WatchRegistry) owns one poller thread. The thread owns every
//! [`WatchHandle`](handle::WatchHandle) registered through it and is the only actor that issues,
//! waits on, or cancels their reads. Registrants learn about changes and recoverable failures
//! through [`WatchSignal`]s.

use std::fmt;
use std::path::PathBuf;

pub mod backend;
pub mod handle;
pub mod notifier;
pub mod observer;
pub mod poller;
pub mod registry;

use notifier::{EventBatch, IssueFailure};

/// Registration identity handed back by [`WatchRegistry::register`](registry::WatchRegistry::register).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey(pub u64);

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// Delivered from the poller to registrants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchSignal {
    Events { key: WatchKey, batch: EventBatch },
    /// A read could not be started. The key stays registered and is retried after a back-off.
    IssueFailed {
        key: WatchKey,
        path: PathBuf,
        reason: IssueFailure,
    },
    /// A cancellation was not confirmed in time; the poller keeps trying to reap it.
    CancelTimeout { key: WatchKey },
}

impl WatchSignal {
    pub fn key(&self) -> WatchKey {
        match self {
            WatchSignal::Events { key, .. }
            | WatchSignal::IssueFailed { key, .. }
            | WatchSignal::CancelTimeout { key } => *key,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, WatchSignal::IssueFailed { reason, .. } if reason.is_access_denied())
    }
}
