//! [`ChangeNotifier`](crate::watch::notifier::ChangeNotifier) implementations.

#[cfg(feature = "notify-backend")]
pub mod native;
pub mod scripted;

#[cfg(feature = "notify-backend")]
pub use native::NotifyBackend;
pub use scripted::{ProtocolEvent, ScriptedNotifier};
