//! End-to-end stress runs: verdicts, deadlines, hang detection and cleanup.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dirwatch_core::diagnostics::threads::{Frame, FrameSample, ThreadSnapshot, WorkerId};
use dirwatch_core::harness::FailureCause;
use dirwatch_core::watch::notifier::{
    CancelAck, DirHandle, OpenFailure, RequestToken, WaitOutcome,
};
use dirwatch_core::{
    ChangeNotifier, IssueFailure, OracleConfig, PollerConfig, RunMode, ScriptedNotifier, StressConfig,
    StressHarness, ThreadRegistry, Verdict,
};
use tokio_util::sync::CancellationToken;

fn quick_config(iterations: usize) -> StressConfig {
    StressConfig {
        iterations,
        deadline: Duration::from_secs(300),
        settle: Duration::from_millis(5),
        poller: PollerConfig {
            wait_slice: Duration::from_millis(10),
            cancel_timeout: Duration::from_millis(100),
            idle_tick: Duration::from_millis(10),
            signal_capacity: 64,
        },
        oracle: OracleConfig {
            stall_threshold: Duration::from_millis(1_000),
            cooldown: Duration::from_millis(20),
        },
    }
}

fn scripted() -> Arc<ScriptedNotifier> {
    Arc::new(ScriptedNotifier::new())
}

fn dir_is_empty(path: &std::path::Path) -> bool {
    fs::read_dir(path).unwrap().next().is_none()
}

/// Reports one worker parked in the completion wait for a long time, on every sample.
#[derive(Debug)]
struct StuckWorkerRegistry;

impl ThreadRegistry for StuckWorkerRegistry {
    fn snapshot(&self) -> Vec<ThreadSnapshot> {
        let since = Instant::now()
            .checked_sub(Duration::from_secs(5))
            .unwrap_or_else(Instant::now);
        vec![ThreadSnapshot {
            id: WorkerId(0),
            name: "dirwatch-poller-stuck".into(),
            stack: vec![
                FrameSample {
                    frame: Frame::PollerLoop,
                    entered_at: since,
                },
                FrameSample {
                    frame: Frame::AwaitCompletion,
                    entered_at: since,
                },
            ],
        }]
    }
}

#[test]
fn provoked_access_denied_without_hang_passes() {
    let base = tempfile::tempdir().unwrap();
    let notifier = scripted();
    notifier.fail_every(1);
    let harness = StressHarness::new(
        Arc::clone(&notifier) as Arc<dyn ChangeNotifier>,
        quick_config(16),
    );

    let report = harness.run(RunMode::Sequential, Some(base.path())).unwrap();
    assert_eq!(report.verdict, Verdict::Passed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.stats.iterations, 16);
    assert_eq!(report.stats.access_denied, 16);
    assert_eq!(report.stats.oracle_samples, 16);
    assert_eq!(report.stats.cleanup_failures, 0);
    assert!(dir_is_empty(base.path()));
    assert!(notifier.violations().is_empty());
    assert_eq!(notifier.open_handles(), 0);
}

/// Refuses every directory open, as if the directory vanished before each registration.
#[derive(Debug)]
struct VanishedDirectory;

impl ChangeNotifier for VanishedDirectory {
    fn name(&self) -> &'static str {
        "vanished"
    }

    fn open_directory(&self, _path: &std::path::Path) -> Result<DirHandle, OpenFailure> {
        Err(OpenFailure::NotFound)
    }

    fn issue_read(&self, _dir: &DirHandle) -> Result<RequestToken, IssueFailure> {
        Err(IssueFailure::Other("never opened".into()))
    }

    fn wait_for_completion(&self, _token: &RequestToken, _timeout: Duration) -> WaitOutcome {
        WaitOutcome::TimedOut
    }

    fn cancel(&self, _token: &RequestToken) -> CancelAck {
        CancelAck::NotPending
    }

    fn close(&self, _dir: DirHandle) {}
}

#[test]
fn open_failures_at_registration_are_counted_apart_from_issue_failures() {
    let base = tempfile::tempdir().unwrap();
    let harness = StressHarness::new(Arc::new(VanishedDirectory), quick_config(4));

    let report = harness.run(RunMode::Sequential, Some(base.path())).unwrap();
    assert_eq!(report.verdict, Verdict::Inconclusive);
    assert_eq!(report.stats.iterations, 4);
    assert_eq!(report.stats.open_failures, 4);
    assert_eq!(report.stats.other_issue_failures, 0);
    assert_eq!(report.stats.access_denied, 0);
}

#[test]
fn never_provoked_is_inconclusive() {
    let base = tempfile::tempdir().unwrap();
    // Without path checks the churn itself can never refuse a read.
    let notifier = Arc::new(ScriptedNotifier::new().without_path_checks());
    let harness = StressHarness::new(notifier, quick_config(8));

    let report = harness.run(RunMode::Sequential, Some(base.path())).unwrap();
    assert_eq!(report.verdict, Verdict::Inconclusive);
    assert_eq!(report.exit_code(), 2);
    assert!(report.summary().contains("cannot reproduce"));
}

#[test]
fn confirmed_hang_fails_with_iteration_and_count() {
    let base = tempfile::tempdir().unwrap();
    let notifier = scripted();
    notifier.fail_every(1);
    let harness =
        StressHarness::new(notifier, quick_config(8)).with_thread_registry(Arc::new(StuckWorkerRegistry));

    let report = harness.run(RunMode::Sequential, Some(base.path())).unwrap();
    match &report.verdict {
        Verdict::Failed {
            cause:
                FailureCause::HangConfirmed {
                    iteration,
                    access_denied,
                    workers,
                },
        } => {
            assert_eq!(*iteration, 0);
            assert_eq!(*access_denied, 1);
            assert_eq!(workers, &vec!["dirwatch-poller-stuck".to_string()]);
        }
        other => panic!("expected a confirmed hang, got {other:?}"),
    }
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.stats.oracle_samples, 2);
    assert!(report.summary().contains("iteration: [0]"));
    assert!(dir_is_empty(base.path()));
}

#[test]
fn exceeding_the_deadline_fails_the_run() {
    let base = tempfile::tempdir().unwrap();
    let config = StressConfig {
        deadline: Duration::from_millis(200),
        ..quick_config(1_000_000)
    };
    let harness = StressHarness::new(scripted(), config);

    let started = Instant::now();
    let report = harness.run(RunMode::Concurrent, Some(base.path())).unwrap();
    assert!(matches!(
        report.verdict,
        Verdict::Failed {
            cause: FailureCause::DeadlineExceeded { deadline_ms: 200 }
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.stats.iterations < 1_000_000);
}

#[test]
fn external_cancellation_is_inconclusive() {
    let base = tempfile::tempdir().unwrap();
    let notifier = scripted();
    notifier.fail_every(1);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let harness = StressHarness::new(notifier, quick_config(64)).with_cancellation(cancel);

    let report = harness.run(RunMode::Concurrent, Some(base.path())).unwrap();
    assert_eq!(report.verdict, Verdict::Inconclusive);
    assert_eq!(report.stats.iterations, 0);
    assert_eq!(report.stats.churn_iterations, 0);
}

#[test]
fn concurrent_scripted_run_is_clean() {
    let base = tempfile::tempdir().unwrap();
    let notifier = scripted();
    notifier.fail_every(4);
    let harness = StressHarness::new(
        Arc::clone(&notifier) as Arc<dyn ChangeNotifier>,
        quick_config(64),
    );

    let report = harness.run(RunMode::Concurrent, Some(base.path())).unwrap();
    assert_ne!(report.exit_code(), 1, "{}", report.summary());
    assert_eq!(report.stats.iterations, 64);
    assert_eq!(report.stats.churn_iterations, 64);
    assert_eq!(report.stats.unresponsive_closes, 0);
    assert!(notifier.violations().is_empty(), "{:?}", notifier.violations());
    assert_eq!(notifier.outstanding_requests(), 0);
    assert!(harness.worker_registry().snapshot().is_empty());
}

#[cfg(feature = "notify-backend")]
mod native {
    use super::*;
    use dirwatch_core::NotifyBackend;

    #[test]
    fn sequential_churn_never_hangs() {
        let base = tempfile::tempdir().unwrap();
        let harness = StressHarness::new(Arc::new(NotifyBackend::new()), quick_config(1_000));

        let report = harness.run(RunMode::Sequential, Some(base.path())).unwrap();
        assert!(
            !matches!(report.verdict, Verdict::Failed { .. }),
            "{}",
            report.summary()
        );
        assert_eq!(report.stats.iterations, 1_000);
        assert_eq!(report.stats.unresponsive_closes, 0);
        assert!(dir_is_empty(base.path()));
    }

    #[test]
    fn concurrent_churn_finishes_within_deadline() {
        let base = tempfile::tempdir().unwrap();
        let harness = StressHarness::new(Arc::new(NotifyBackend::new()), quick_config(1_024));

        let report = harness.run(RunMode::Concurrent, Some(base.path())).unwrap();
        assert!(
            !matches!(report.verdict, Verdict::Failed { .. }),
            "{}",
            report.summary()
        );
        assert_eq!(report.stats.iterations, 1_024);
        assert_eq!(report.stats.churn_iterations, 1_024);
        assert!(report.elapsed() < Duration::from_secs(300));
        assert!(dir_is_empty(base.path()));
    }
}
