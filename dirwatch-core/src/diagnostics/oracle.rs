//! Hang detection over worker stack snapshots.
//!
//! A single sample cannot tell a slow-but-progressing wait from a stuck one, so callers confirm a
//! hang with [`HangOracle::confirm`], which samples twice with a cooldown in between.

use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::config::OracleConfig;
use crate::diagnostics::threads::{Frame, ThreadRegistry, ThreadSnapshot};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HangVerdict {
    Clear,
    /// First sample looked hung, the second did not.
    Transient,
    Hung { workers: Vec<String> },
}

impl HangVerdict {
    pub fn is_hung(&self) -> bool {
        matches!(self, HangVerdict::Hung { .. })
    }
}

/// Stateless sampler: every decision is derived from the registry handed in.
#[derive(Clone, Copy, Debug)]
pub struct HangOracle {
    stall_threshold: Duration,
    cooldown: Duration,
}

impl HangOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self {
            stall_threshold: config.stall_threshold,
            cooldown: config.cooldown,
        }
    }

    /// Names of workers currently inside the completion wait for longer than the threshold.
    pub fn stalled_workers(&self, registry: &dyn ThreadRegistry) -> Vec<String> {
        registry
            .snapshot()
            .into_iter()
            .filter(|thread| self.is_stalled(thread))
            .map(|thread| thread.name)
            .collect()
    }

    /// Point-in-time "currently appears hung" signal.
    pub fn sample(&self, registry: &dyn ThreadRegistry) -> bool {
        !self.stalled_workers(registry).is_empty()
    }

    /// Sample, wait out the cooldown, sample again. Only two hung samples make a hang.
    pub fn confirm(&self, registry: &dyn ThreadRegistry) -> HangVerdict {
        if !self.sample(registry) {
            return HangVerdict::Clear;
        }
        debug!(
            target: "dirwatch::oracle",
            cooldown_ms = self.cooldown.as_millis() as u64,
            "worker appears stuck in completion wait; resampling after cooldown"
        );
        thread::sleep(self.cooldown);

        let workers = self.stalled_workers(registry);
        if workers.is_empty() {
            HangVerdict::Transient
        } else {
            error!(
                target: "dirwatch::oracle",
                ?workers,
                frame = Frame::AwaitCompletion.symbol(),
                "completion wait hang confirmed"
            );
            HangVerdict::Hung { workers }
        }
    }

    fn is_stalled(&self, thread: &ThreadSnapshot) -> bool {
        thread
            .stack
            .iter()
            .any(|s| s.frame == Frame::AwaitCompletion && s.elapsed() > self.stall_threshold)
    }
}
