use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::watch::notifier::{IssueFailure, OpenFailure};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open {}: {reason}", path.display())]
    Open { path: PathBuf, reason: OpenFailure },

    #[error("failed to issue read for {}: {reason}", path.display())]
    IssueFailed { path: PathBuf, reason: IssueFailure },

    #[error("cancellation of {pending} request(s) not confirmed within {timeout:?}")]
    CancelTimeout { pending: usize, timeout: Duration },

    #[error("poller `{worker}` did not stop within {waited:?}")]
    PollerUnresponsive { worker: String, waited: Duration },

    #[error("watch registry is closed")]
    RegistryClosed,

    #[error("unknown watch key: {0}")]
    UnknownKey(u64),

    #[error(
        "poller thread hangs in completion wait on iteration [{iteration}], access denied count [{access_denied}]"
    )]
    HangConfirmed {
        iteration: usize,
        access_denied: u64,
        workers: Vec<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WatchError {
    /// True for the transient issue failure produced by directory churn.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            WatchError::IssueFailed {
                reason: IssueFailure::AccessDenied,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;
