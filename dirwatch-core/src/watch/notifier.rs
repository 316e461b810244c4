//! The change-notification primitive consumed by the poller.
//!
//! A [`ChangeNotifier`] mirrors an overlapped directory read: a request is issued against an open
//! directory handle, its completion is collected later with a bounded wait, and an outstanding
//! request can be cancelled. Implementations must uphold one rule above all others: a
//! [`RequestToken`] is handed out only when the read was actually started.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identity of an open directory handle within one notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// An open directory handle. Deliberately not `Clone`: it is owned by exactly one
/// [`WatchHandle`](crate::watch::handle::WatchHandle) and closed exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct DirHandle {
    id: HandleId,
    path: PathBuf,
}

impl DirHandle {
    /// Constructor for [`ChangeNotifier`] implementations.
    pub fn new(id: HandleId, path: PathBuf) -> Self {
        Self { id, path }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Correlates an accepted read with its completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestToken {
    handle: HandleId,
    sequence: u64,
}

impl RequestToken {
    /// Minted by a notifier at the moment it accepts a read, never on a failed issue.
    pub fn accepted(handle: HandleId, sequence: u64) -> Self {
        Self { handle, sequence }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.handle, self.sequence)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenFailure {
    NotFound,
    NotADirectory,
    AccessDenied,
    Other(String),
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenFailure::NotFound => f.write_str("directory not found"),
            OpenFailure::NotADirectory => f.write_str("not a directory"),
            OpenFailure::AccessDenied => f.write_str("Access is denied"),
            OpenFailure::Other(msg) => f.write_str(msg),
        }
    }
}

/// Synchronous refusal to start a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IssueFailure {
    /// The directory was deleted or replaced underneath the handle. Expected under churn.
    AccessDenied,
    Other(String),
}

impl IssueFailure {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, IssueFailure::AccessDenied)
    }
}

impl fmt::Display for IssueFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueFailure::AccessDenied => f.write_str("Access is denied"),
            IssueFailure::Other(msg) => f.write_str(msg),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
    /// Events were lost; the registrant should rescan.
    Overflow,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Payload of a completed read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub events: Vec<ChangeEvent>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(EventBatch),
    /// A previously requested cancellation took effect.
    Cancelled,
    TimedOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelAck {
    /// Cancellation was queued; its confirmation arrives through `wait_for_completion`.
    Requested,
    /// The request was no longer outstanding (it completed concurrently with the cancel).
    NotPending,
}

/// Asynchronous directory change-notification primitive.
pub trait ChangeNotifier: Send + Sync + fmt::Debug {
    /// Short backend name for logs and reports.
    fn name(&self) -> &'static str;

    fn open_directory(&self, path: &Path) -> Result<DirHandle, OpenFailure>;

    /// Start an asynchronous read. Returns a token only if the read was started.
    fn issue_read(&self, dir: &DirHandle) -> Result<RequestToken, IssueFailure>;

    /// Block for at most `timeout` until the request completes or its cancellation is confirmed.
    fn wait_for_completion(&self, token: &RequestToken, timeout: Duration) -> WaitOutcome;

    fn cancel(&self, token: &RequestToken) -> CancelAck;

    fn close(&self, dir: DirHandle);
}
