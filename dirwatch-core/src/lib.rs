//! # dirwatch core
//!
//! A directory watch poller whose asynchronous read lifecycle cannot wedge, plus the stress
//! harness that tries hard to make it wedge anyway.
//!
//! ## Overview
//!
//! - **Watch registry**: subscribe and unsubscribe directories; one background poller thread per
//!   registry issues reads, waits a bounded slice for each, and cancels what does not complete
//! - **Request protocol**: a read can only be waited on through the [`PendingRead`] that a
//!   successful issue returns, so a refused issue (the transient "access denied" seen while a
//!   directory is deleted and recreated) never leads to a wait on nothing
//! - **Hang oracle**: samples worker frame stacks and confirms a hang with a second sample
//! - **Stress harness**: sequential and concurrent churn runs with a wall-clock deadline
//!
//! ## Feature Flags
//!
//! - `notify-backend` (default): real change notifications through the `notify` crate
//!
//! ## Architecture
//!
//! - [`watch`]: registry, poller, handle lifecycle and the [`ChangeNotifier`] seam
//! - [`diagnostics`]: worker frame registry and the hang oracle
//! - [`mutator`]: destructive directory operations used as workload
//! - [`harness`]: driver pool, run modes and reports
//! - [`config`]: serializable settings and their runtime forms
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dirwatch_core::{
//!     PollerConfig, ScriptedNotifier, WatchRegistry, WatchSignal, WorkerRegistry,
//! };
//!
//! # fn main() -> dirwatch_core::Result<()> {
//! let notifier = Arc::new(ScriptedNotifier::new());
//! let registry = WatchRegistry::open(
//!     notifier,
//!     Arc::new(WorkerRegistry::new()),
//!     PollerConfig::default(),
//! )?;
//! let key = registry.register("/tmp/watched")?;
//! if let Some(WatchSignal::Events { batch, .. }) = registry.poll_signal(Duration::from_secs(1)) {
//!     println!("{key}: {} change(s)", batch.len());
//! }
//! registry.close()?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Settings and runtime configuration
pub mod config;
/// Hang diagnostics
pub mod diagnostics;
pub mod error;
/// Stress runs over live registries
pub mod harness;
pub mod mutator;
/// Directory watching
pub mod watch;

pub use config::{
    OracleConfig, OracleSettings, PollerConfig, PollerSettings, StressConfig, StressSettings,
};
pub use diagnostics::{HangOracle, HangVerdict, ThreadRegistry, WorkerRegistry};
pub use error::{Result, WatchError};
pub use harness::{RunMode, RunReport, RunStats, StressHarness, Verdict};
pub use mutator::DirectoryMutator;
#[cfg(feature = "notify-backend")]
pub use watch::backend::NotifyBackend;
pub use watch::backend::ScriptedNotifier;
pub use watch::handle::{PendingRead, ReadOutcome, WatchHandle};
pub use watch::notifier::{ChangeKind, ChangeNotifier, EventBatch, IssueFailure};
pub use watch::registry::WatchRegistry;
pub use watch::{WatchKey, WatchSignal};
