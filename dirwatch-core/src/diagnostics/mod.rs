//! Hang diagnostics: worker stack registry and the oracle that samples it.

pub mod oracle;
pub mod threads;

pub use oracle::{HangOracle, HangVerdict};
pub use threads::{Frame, ThreadRegistry, ThreadSnapshot, WorkerGuard, WorkerRegistry};
