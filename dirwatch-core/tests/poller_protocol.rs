//! Request-protocol behaviour of live registries under fault injection.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dirwatch_core::watch::handle::PollerState;
use dirwatch_core::watch::notifier::{
    CancelAck, DirHandle, OpenFailure, RequestToken, WaitOutcome,
};
use dirwatch_core::watch::observer::PollerObserver;
use dirwatch_core::{
    ChangeKind, ChangeNotifier, HangOracle, HangVerdict, IssueFailure, OracleConfig,
    PollerConfig, ScriptedNotifier, WatchError, WatchKey, WatchRegistry, WatchSignal,
    WorkerRegistry,
};
use parking_lot::Mutex;

/// Tracks, per key, whether a read is outstanding and flags every wait that happens without one.
#[derive(Debug, Default)]
struct RecordingObserver {
    waiting: Mutex<HashMap<WatchKey, bool>>,
    violations: Mutex<Vec<String>>,
    awaits: Mutex<u64>,
    issue_failures: Mutex<u64>,
}

impl RecordingObserver {
    fn violations(&self) -> Vec<String> {
        self.violations.lock().clone()
    }
}

impl PollerObserver for RecordingObserver {
    fn on_transition(&self, key: WatchKey, from: PollerState, to: PollerState) {
        if from == PollerState::IssueFailed && to != PollerState::Idle {
            self.violations
                .lock()
                .push(format!("{key}: IssueFailed -> {to:?}"));
        }
        let mut waiting = self.waiting.lock();
        match to {
            PollerState::Waiting => {
                if from != PollerState::Issuing {
                    self.violations
                        .lock()
                        .push(format!("{key}: {from:?} -> Waiting"));
                }
                waiting.insert(key, true);
            }
            PollerState::Completed | PollerState::Cancelled | PollerState::IssueFailed => {
                waiting.insert(key, false);
            }
            _ => {}
        }
    }

    fn on_issue_failed(&self, _key: WatchKey, _reason: &IssueFailure) {
        *self.issue_failures.lock() += 1;
    }

    fn on_await(&self, key: WatchKey, token: &RequestToken) {
        *self.awaits.lock() += 1;
        if !self.waiting.lock().get(&key).copied().unwrap_or(false) {
            self.violations
                .lock()
                .push(format!("{key}: wait on {token} with nothing pending"));
        }
    }
}

fn fast_config() -> PollerConfig {
    PollerConfig {
        wait_slice: Duration::from_millis(10),
        cancel_timeout: Duration::from_millis(100),
        idle_tick: Duration::from_millis(10),
        signal_capacity: 256,
    }
}

fn open_with(
    notifier: &Arc<ScriptedNotifier>,
    observer: &Arc<RecordingObserver>,
    config: PollerConfig,
) -> WatchRegistry {
    WatchRegistry::with_observer(
        Arc::clone(notifier) as Arc<dyn ChangeNotifier>,
        Arc::new(WorkerRegistry::new()),
        config,
        Arc::clone(observer) as Arc<dyn PollerObserver>,
    )
    .unwrap()
}

fn wait_for<F>(registry: &WatchRegistry, timeout: Duration, mut pred: F) -> Option<WatchSignal>
where
    F: FnMut(&WatchSignal) -> bool,
{
    let until = Instant::now() + timeout;
    while let Some(left) = until.checked_duration_since(Instant::now()) {
        match registry.poll_signal(left) {
            Some(signal) if pred(&signal) => return Some(signal),
            Some(_) => continue,
            None => return None,
        }
    }
    None
}

#[test]
fn waits_only_ever_follow_an_accepted_issue() {
    let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
    let notifier = Arc::new(ScriptedNotifier::new());
    notifier.fail_every(3);
    let observer = Arc::new(RecordingObserver::default());
    let registry = open_with(&notifier, &observer, fast_config());

    for dir in &dirs {
        // Every third issue is refused, including some first reads at registration.
        let _ = registry.register(dir.path());
    }
    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(300) {
        for dir in &dirs {
            notifier.emit(dir.path().join("churn"), ChangeKind::Modified);
        }
        thread::sleep(Duration::from_millis(5));
    }
    registry.close().unwrap();

    assert!(observer.violations().is_empty(), "{:?}", observer.violations());
    assert!(notifier.violations().is_empty(), "{:?}", notifier.violations());
    assert!(*observer.issue_failures.lock() > 0);
    assert!(*observer.awaits.lock() > 0);
    assert!(registry.stats().issue_failures > 0);
    assert_eq!(notifier.outstanding_requests(), 0);
    assert_eq!(notifier.open_handles(), 0);
}

#[test]
fn issue_failure_returns_to_idle_and_recovers_once_directory_returns() {
    let base = tempfile::tempdir().unwrap();
    let watched = base.path().join("watched");
    fs::create_dir(&watched).unwrap();
    let notifier = Arc::new(ScriptedNotifier::new());
    let observer = Arc::new(RecordingObserver::default());
    let registry = open_with(&notifier, &observer, fast_config());

    let key = registry.register(&watched).unwrap();
    fs::remove_dir(&watched).unwrap();

    let failure = wait_for(&registry, Duration::from_secs(2), |s| s.is_access_denied())
        .expect("re-issue on a deleted directory is refused");
    assert_eq!(failure.key(), key);

    fs::create_dir(&watched).unwrap();
    // Events only reach the directory once the poller has reopened it, so keep producing them.
    let until = Instant::now() + Duration::from_secs(3);
    let mut recovered = None;
    while recovered.is_none() && Instant::now() < until {
        notifier.emit(watched.join("back"), ChangeKind::Created);
        recovered = wait_for(&registry, Duration::from_millis(50), |s| {
            matches!(s, WatchSignal::Events { .. })
        });
    }
    assert_eq!(recovered.map(|s| s.key()), Some(key));

    registry.close().unwrap();
    assert!(observer.violations().is_empty(), "{:?}", observer.violations());
    assert!(notifier.violations().is_empty());
}

#[test]
fn close_with_read_in_flight_cancels_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(ScriptedNotifier::new());
    // A completion is queued but held back far longer than any timeout.
    notifier.set_completion_delay(Duration::from_secs(30));
    notifier.set_cancel_delay(Duration::from_millis(20));
    let observer = Arc::new(RecordingObserver::default());
    let config = PollerConfig {
        wait_slice: Duration::from_millis(50),
        ..fast_config()
    };
    let registry = open_with(&notifier, &observer, config);

    registry.register(dir.path()).unwrap();
    notifier.emit(dir.path().join("held"), ChangeKind::Created);

    let started = Instant::now();
    registry.close().unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed <= config.close_bound(),
        "close took {elapsed:?}, bound {:?}",
        config.close_bound()
    );
    assert_eq!(notifier.open_handles(), 0);
    assert_eq!(notifier.outstanding_requests(), 0);
    assert!(notifier.violations().is_empty());
}

#[test]
fn unconfirmed_cancel_leaks_the_handle_instead_of_closing_it() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(ScriptedNotifier::new());
    notifier.set_cancel_delay(Duration::from_secs(30));
    let observer = Arc::new(RecordingObserver::default());
    let config = PollerConfig {
        wait_slice: Duration::from_millis(10),
        cancel_timeout: Duration::from_millis(30),
        ..fast_config()
    };
    let registry = open_with(&notifier, &observer, config);
    registry.register(dir.path()).unwrap();
    thread::sleep(Duration::from_millis(20));

    let err = registry.close().unwrap_err();
    assert!(
        matches!(
            err,
            WatchError::CancelTimeout { .. } | WatchError::PollerUnresponsive { .. }
        ),
        "unexpected {err:?}"
    );

    // Give a detached worker time to finish its own teardown.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(notifier.open_handles(), 1);
    assert_eq!(notifier.outstanding_requests(), 1);
    assert!(notifier.violations().is_empty(), "{:?}", notifier.violations());
}

#[test]
fn close_on_idle_registry_returns_quickly() {
    let notifier = Arc::new(ScriptedNotifier::new());
    let observer = Arc::new(RecordingObserver::default());
    let config = fast_config();
    let registry = open_with(&notifier, &observer, config);

    let started = Instant::now();
    registry.close().unwrap();
    assert!(started.elapsed() <= config.close_bound());
    registry.close().unwrap();
}

#[test]
fn oracle_sees_poller_parked_in_completion_wait() {
    let dir = tempfile::tempdir().unwrap();
    let notifier = Arc::new(ScriptedNotifier::new());
    let threads = Arc::new(WorkerRegistry::new());
    // One wait slice far outlasts the stall threshold.
    let config = PollerConfig {
        wait_slice: Duration::from_secs(3),
        cancel_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let registry = WatchRegistry::open(
        Arc::clone(&notifier) as Arc<dyn ChangeNotifier>,
        Arc::clone(&threads),
        config,
    )
    .unwrap();
    registry.register(dir.path()).unwrap();
    thread::sleep(Duration::from_millis(300));

    let oracle = HangOracle::new(OracleConfig {
        stall_threshold: Duration::from_millis(100),
        cooldown: Duration::from_millis(50),
    });
    match oracle.confirm(&*threads) {
        HangVerdict::Hung { workers } => {
            assert_eq!(workers.len(), 1);
            assert!(workers[0].starts_with("dirwatch-poller-"), "{workers:?}");
        }
        other => panic!("expected a confirmed hang, got {other:?}"),
    }

    registry.close().unwrap();
    assert_eq!(threads.live_workers(), 0);
    assert_eq!(oracle.confirm(&*threads), HangVerdict::Clear);
}

/// Scripted notifier whose directory opens take longer than a registry waits for an answer.
#[derive(Debug)]
struct SlowOpenNotifier {
    inner: Arc<ScriptedNotifier>,
    open_delay: Duration,
}

impl ChangeNotifier for SlowOpenNotifier {
    fn name(&self) -> &'static str {
        "slow-open"
    }

    fn open_directory(&self, path: &std::path::Path) -> Result<DirHandle, OpenFailure> {
        thread::sleep(self.open_delay);
        self.inner.open_directory(path)
    }

    fn issue_read(&self, dir: &DirHandle) -> Result<RequestToken, IssueFailure> {
        self.inner.issue_read(dir)
    }

    fn wait_for_completion(&self, token: &RequestToken, timeout: Duration) -> WaitOutcome {
        self.inner.wait_for_completion(token, timeout)
    }

    fn cancel(&self, token: &RequestToken) -> CancelAck {
        self.inner.cancel(token)
    }

    fn close(&self, dir: DirHandle) {
        self.inner.close(dir)
    }
}

#[test]
fn registration_the_caller_gave_up_on_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let scripted = Arc::new(ScriptedNotifier::new());
    let notifier = Arc::new(SlowOpenNotifier {
        inner: Arc::clone(&scripted),
        open_delay: Duration::from_millis(300),
    });
    let config = PollerConfig {
        wait_slice: Duration::from_millis(10),
        cancel_timeout: Duration::from_millis(20),
        ..fast_config()
    };
    let registry = WatchRegistry::open(
        notifier as Arc<dyn ChangeNotifier>,
        Arc::new(WorkerRegistry::new()),
        config,
    )
    .unwrap();

    let err = registry.register(dir.path()).unwrap_err();
    assert!(
        matches!(err, WatchError::PollerUnresponsive { .. }),
        "unexpected {err:?}"
    );

    let until = Instant::now() + Duration::from_secs(3);
    let mut opened = false;
    while Instant::now() < until {
        let log = scripted.protocol_log();
        opened |= !log.is_empty();
        if opened && scripted.open_handles() == 0 {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(opened, "the slow registration never reached the notifier");
    assert_eq!(scripted.open_handles(), 0);
    assert_eq!(scripted.outstanding_requests(), 0);

    registry.close().unwrap();
    assert!(scripted.violations().is_empty(), "{:?}", scripted.violations());
}

#[cfg(feature = "notify-backend")]
#[test]
fn native_watch_recovers_after_directory_is_recreated() {
    use dirwatch_core::NotifyBackend;

    let base = tempfile::tempdir().unwrap();
    let watched = base.path().join("watched");
    fs::create_dir(&watched).unwrap();
    let registry = WatchRegistry::open(
        Arc::new(NotifyBackend::new()),
        Arc::new(WorkerRegistry::new()),
        fast_config(),
    )
    .unwrap();
    let key = registry.register(&watched).unwrap();

    fs::remove_dir(&watched).unwrap();
    fs::create_dir(&watched).unwrap();

    // The removal itself completes the read already in flight; only later files prove recovery.
    let written_after = |signal: &WatchSignal| match signal {
        WatchSignal::Events { batch, .. } => batch.events.iter().any(|event| {
            event
                .path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("after-"))
        }),
        _ => false,
    };
    let until = Instant::now() + Duration::from_secs(5);
    let mut recovered = None;
    let mut n = 0u32;
    while recovered.is_none() && Instant::now() < until {
        fs::write(watched.join(format!("after-{n}")), b"x").unwrap();
        n += 1;
        recovered = wait_for(&registry, Duration::from_millis(100), written_after);
    }
    assert_eq!(recovered.map(|s| s.key()), Some(key));

    registry.close().unwrap();
}
