//! Serializable settings and their runtime forms.
//!
//! Settings carry plain millisecond/second fields so they read naturally from TOML or JSON; the
//! `*Config` structs hold the converted [`Duration`]s the runtime works with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatchError};

/// Poller tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Longest single completion wait before the poller cancels and re-issues.
    pub wait_slice_ms: u64,
    /// Bound on waiting for a cancellation to be confirmed.
    pub cancel_timeout_ms: u64,
    /// How long an idle worker blocks on its command channel between checks.
    pub idle_tick_ms: u64,
    /// Capacity of the signal channel towards registrants.
    pub signal_capacity: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            wait_slice_ms: 50,
            cancel_timeout_ms: 500,
            idle_tick_ms: 50,
            signal_capacity: 1024,
        }
    }
}

/// Hang oracle tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleSettings {
    /// A completion wait older than this looks hung.
    pub stall_threshold_ms: u64,
    /// Delay between the two samples that confirm a hang.
    pub cooldown_ms: u64,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            stall_threshold_ms: 1_000,
            cooldown_ms: 1_000,
        }
    }
}

/// Top-level stress run settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressSettings {
    /// Iterations per driver.
    pub iterations: usize,
    /// Hard wall-clock bound for a whole run.
    pub deadline_secs: u64,
    /// Window after a mutation in which the poller may surface an issue failure.
    pub settle_ms: u64,
    pub poller: PollerSettings,
    pub oracle: OracleSettings,
}

impl Default for StressSettings {
    fn default() -> Self {
        Self {
            iterations: 1024,
            deadline_secs: 300,
            settle_ms: 20,
            poller: PollerSettings::default(),
            oracle: OracleSettings::default(),
        }
    }
}

impl StressSettings {
    /// Reject values that would make a run meaningless or unbounded.
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(WatchError::Config("iterations must be at least 1".into()));
        }
        if self.deadline_secs == 0 {
            return Err(WatchError::Config("deadline_secs must be at least 1".into()));
        }
        if self.poller.wait_slice_ms == 0 || self.poller.cancel_timeout_ms == 0 {
            return Err(WatchError::Config(
                "poller wait_slice_ms and cancel_timeout_ms must be non-zero".into(),
            ));
        }
        if self.poller.signal_capacity == 0 {
            return Err(WatchError::Config("signal_capacity must be non-zero".into()));
        }
        Ok(())
    }
}

/// Runtime poller configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollerConfig {
    pub wait_slice: Duration,
    pub cancel_timeout: Duration,
    pub idle_tick: Duration,
    pub signal_capacity: usize,
}

impl PollerConfig {
    /// Upper bound for a registry close: two cancel timeouts plus one in-progress wait slice.
    pub fn close_bound(&self) -> Duration {
        self.cancel_timeout * 2 + self.wait_slice
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerSettings::default().into()
    }
}

impl From<PollerSettings> for PollerConfig {
    fn from(cfg: PollerSettings) -> Self {
        Self {
            wait_slice: Duration::from_millis(cfg.wait_slice_ms.max(1)),
            cancel_timeout: Duration::from_millis(cfg.cancel_timeout_ms.max(1)),
            idle_tick: Duration::from_millis(cfg.idle_tick_ms.max(1)),
            signal_capacity: cfg.signal_capacity.max(1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OracleConfig {
    pub stall_threshold: Duration,
    pub cooldown: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        OracleSettings::default().into()
    }
}

impl From<OracleSettings> for OracleConfig {
    fn from(cfg: OracleSettings) -> Self {
        Self {
            stall_threshold: Duration::from_millis(cfg.stall_threshold_ms),
            cooldown: Duration::from_millis(cfg.cooldown_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StressConfig {
    pub iterations: usize,
    pub deadline: Duration,
    pub settle: Duration,
    pub poller: PollerConfig,
    pub oracle: OracleConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        StressSettings::default().into()
    }
}

impl From<StressSettings> for StressConfig {
    fn from(cfg: StressSettings) -> Self {
        Self {
            iterations: cfg.iterations,
            deadline: Duration::from_secs(cfg.deadline_secs),
            settle: Duration::from_millis(cfg.settle_ms),
            poller: cfg.poller.into(),
            oracle: cfg.oracle.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: StressSettings =
            serde_json::from_str(r#"{"iterations": 10, "poller": {"cancel_timeout_ms": 200}}"#)
                .unwrap();
        assert_eq!(settings.iterations, 10);
        assert_eq!(settings.poller.cancel_timeout_ms, 200);
        assert_eq!(settings.poller.wait_slice_ms, 50);
        assert_eq!(settings.oracle, OracleSettings::default());
    }

    #[test]
    fn close_bound_covers_two_cancel_timeouts() {
        let config = PollerConfig::from(PollerSettings {
            wait_slice_ms: 10,
            cancel_timeout_ms: 100,
            ..PollerSettings::default()
        });
        assert_eq!(config.close_bound(), Duration::from_millis(210));
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let settings = StressSettings {
            iterations: 0,
            ..StressSettings::default()
        };
        assert!(matches!(settings.validate(), Err(WatchError::Config(_))));
    }
}
