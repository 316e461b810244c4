//! Change notifications from the platform watcher via `notify`.
//!
//! `notify` delivers events through a callback, so the overlapped-read shape is layered on top:
//! every handle owns a watcher feeding a channel, an issued read is an outstanding claim on the
//! next message from that channel, and cancellation is acknowledged on the next wait.
//!
//! A handle dies once its root is removed or renamed away (reported by the watcher), or is found
//! missing or replaced when a read is issued. The watcher of a dead handle is bound to a
//! directory that no longer exists, so even when the path comes back (possibly with the same
//! inode) the handle refuses every read with access denied. Callers reopen the path to arm a
//! fresh watcher.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, unbounded};
use notify::event::{EventKind, ModifyKind, RemoveKind};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::watch::notifier::{
    CancelAck, ChangeEvent, ChangeKind, ChangeNotifier, DirHandle, EventBatch, HandleId,
    IssueFailure, OpenFailure, RequestToken, WaitOutcome,
};

type DirIdentity = (u64, u64);

#[derive(Debug, Default)]
struct RequestState {
    next_sequence: u64,
    outstanding: Option<u64>,
    cancel_requested: bool,
}

struct NativeHandle {
    path: PathBuf,
    identity: Option<DirIdentity>,
    rx: Receiver<notify::Result<Event>>,
    dead: Arc<AtomicBool>,
    requests: Mutex<RequestState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("dead", &self.dead.load(Ordering::Relaxed))
            .field("queued", &self.rx.len())
            .finish()
    }
}

/// Real notifier backed by the platform's recommended `notify` watcher.
#[derive(Default)]
pub struct NotifyBackend {
    next_handle: AtomicU64,
    handles: Mutex<HashMap<HandleId, Arc<NativeHandle>>>,
}

impl fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("NotifyBackend");
        match self.handles.try_lock() {
            Some(guard) => debug.field("open_handles", &guard.len()),
            None => debug.field("handles", &"<locked>"),
        };
        debug.finish()
    }
}

impl NotifyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, id: HandleId) -> Option<Arc<NativeHandle>> {
        self.handles.lock().get(&id).cloned()
    }
}

impl ChangeNotifier for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn open_directory(&self, path: &Path) -> Result<DirHandle, OpenFailure> {
        let meta = fs::metadata(path).map_err(open_failure)?;
        if !meta.is_dir() {
            return Err(OpenFailure::NotADirectory);
        }

        let (tx, rx) = unbounded();
        let dead = Arc::new(AtomicBool::new(false));
        let root = path.to_path_buf();
        let marker = Arc::clone(&dead);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if kills_root(&root, &res) {
                    marker.store(true, Ordering::Release);
                }
                // The receiving side goes away on close; late events are dropped.
                let _ = tx.send(res);
            },
            NotifyConfig::default(),
        )
        .map_err(|err| OpenFailure::Other(format!("failed to create watcher: {err}")))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|err| match err.kind {
                notify::ErrorKind::PathNotFound => OpenFailure::NotFound,
                notify::ErrorKind::Io(io_err) => open_failure(io_err),
                _ => OpenFailure::Other(format!("failed to watch {}: {}", path.display(), err)),
            })?;

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let handle = NativeHandle {
            path: path.to_path_buf(),
            identity: dir_identity(&meta),
            rx,
            dead,
            requests: Mutex::new(RequestState::default()),
            watcher: Mutex::new(Some(watcher)),
        };
        self.handles.lock().insert(id, Arc::new(handle));
        debug!(target: "dirwatch::notify", handle = %id, path = %path.display(), "opened");
        Ok(DirHandle::new(id, path.to_path_buf()))
    }

    fn issue_read(&self, dir: &DirHandle) -> Result<RequestToken, IssueFailure> {
        let handle = self
            .lookup(dir.id())
            .ok_or_else(|| IssueFailure::Other(format!("unknown handle {}", dir.id())))?;

        let mut requests = handle.requests.lock();
        if requests.outstanding.is_some() {
            return Err(IssueFailure::Other("request already outstanding".into()));
        }

        revalidate(&handle)?;

        let sequence = requests.next_sequence;
        requests.next_sequence += 1;
        requests.outstanding = Some(sequence);
        requests.cancel_requested = false;
        Ok(RequestToken::accepted(dir.id(), sequence))
    }

    fn wait_for_completion(&self, token: &RequestToken, timeout: Duration) -> WaitOutcome {
        let Some(handle) = self.lookup(token.handle()) else {
            error!(target: "dirwatch::notify", %token, "wait on a closed handle");
            thread::sleep(timeout);
            return WaitOutcome::TimedOut;
        };

        let cancel_requested = {
            let requests = handle.requests.lock();
            if requests.outstanding != Some(token.sequence()) {
                error!(target: "dirwatch::notify", %token, "wait on a request that is not outstanding");
                drop(requests);
                thread::sleep(timeout);
                return WaitOutcome::TimedOut;
            }
            requests.cancel_requested
        };

        if cancel_requested {
            let mut batch = EventBatch::default();
            for res in handle.rx.try_iter() {
                push_result(&mut batch, &handle.path, res);
            }
            handle.requests.lock().outstanding = None;
            return if batch.is_empty() {
                WaitOutcome::Cancelled
            } else {
                WaitOutcome::Completed(batch)
            };
        }

        let mut batch = EventBatch::default();
        match handle.rx.recv_timeout(timeout) {
            Ok(res) => {
                push_result(&mut batch, &handle.path, res);
                for res in handle.rx.try_iter() {
                    push_result(&mut batch, &handle.path, res);
                }
            }
            Err(RecvTimeoutError::Timeout) => return WaitOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => {
                warn!(target: "dirwatch::notify", %token, "watcher channel disconnected");
                batch.events.push(ChangeEvent {
                    kind: ChangeKind::Overflow,
                    path: handle.path.clone(),
                });
            }
        }

        handle.requests.lock().outstanding = None;
        WaitOutcome::Completed(batch)
    }

    fn cancel(&self, token: &RequestToken) -> CancelAck {
        let Some(handle) = self.lookup(token.handle()) else {
            return CancelAck::NotPending;
        };
        let mut requests = handle.requests.lock();
        if requests.outstanding == Some(token.sequence()) {
            requests.cancel_requested = true;
            CancelAck::Requested
        } else {
            CancelAck::NotPending
        }
    }

    fn close(&self, dir: DirHandle) {
        let Some(handle) = self.handles.lock().remove(&dir.id()) else {
            return;
        };
        if let Some(mut watcher) = handle.watcher.lock().take() {
            // Unwatching a directory that is already gone fails; dropping the watcher still
            // releases it.
            let _ = watcher.unwatch(&handle.path);
        }
        debug!(target: "dirwatch::notify", handle = %dir.id(), "closed");
    }
}

fn revalidate(handle: &NativeHandle) -> Result<(), IssueFailure> {
    if handle.dead.load(Ordering::Acquire) {
        return Err(IssueFailure::AccessDenied);
    }
    let verdict = check_identity(handle);
    if verdict == Err(IssueFailure::AccessDenied) {
        handle.dead.store(true, Ordering::Release);
        debug!(target: "dirwatch::notify", path = %handle.path.display(), "watched root gone; handle is dead");
    }
    verdict
}

fn check_identity(handle: &NativeHandle) -> Result<(), IssueFailure> {
    match fs::metadata(&handle.path) {
        Ok(meta) if !meta.is_dir() => Err(IssueFailure::AccessDenied),
        Ok(meta) => match (handle.identity, dir_identity(&meta)) {
            (Some(opened), Some(current)) if opened != current => Err(IssueFailure::AccessDenied),
            _ => Ok(()),
        },
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ) =>
        {
            Err(IssueFailure::AccessDenied)
        }
        Err(err) => Err(IssueFailure::Other(err.to_string())),
    }
}

/// Whether `res` means the watcher lost its root: the root itself was removed or renamed, or the
/// watcher failed.
fn kills_root(root: &Path, res: &notify::Result<Event>) -> bool {
    match res {
        Ok(event) => {
            let root_lost = matches!(
                event.kind,
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
            );
            root_lost && event.paths.iter().any(|path| path == root)
        }
        Err(_) => true,
    }
}

fn open_failure(err: io::Error) -> OpenFailure {
    match err.kind() {
        io::ErrorKind::NotFound => OpenFailure::NotFound,
        io::ErrorKind::PermissionDenied => OpenFailure::AccessDenied,
        _ => OpenFailure::Other(err.to_string()),
    }
}

#[cfg(unix)]
fn dir_identity(meta: &Metadata) -> Option<DirIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn dir_identity(_meta: &Metadata) -> Option<DirIdentity> {
    None
}

fn push_result(batch: &mut EventBatch, root: &Path, res: notify::Result<Event>) {
    match res {
        Ok(event) => {
            let kind = classify_event(&event.kind);
            if event.paths.is_empty() {
                batch.events.push(ChangeEvent {
                    kind,
                    path: root.to_path_buf(),
                });
            }
            for path in event.paths {
                batch.events.push(ChangeEvent { kind, path });
            }
        }
        Err(err) => {
            warn!(target: "dirwatch::notify", root = %root.display(), error = %err, "watch error");
            batch.events.push(ChangeEvent {
                kind: ChangeKind::Overflow,
                path: root.to_path_buf(),
            });
        }
    }
}

fn classify_event(kind: &EventKind) -> ChangeKind {
    match kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(RemoveKind::File | RemoveKind::Folder | RemoveKind::Any) => {
            ChangeKind::Removed
        }
        EventKind::Other => ChangeKind::Overflow,
        _ => ChangeKind::Modified,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn replaced_directory_refuses_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir(&watched).unwrap();

        let backend = NotifyBackend::new();
        let dir = backend.open_directory(&watched).unwrap();

        fs::remove_dir(&watched).unwrap();
        assert_eq!(backend.issue_read(&dir), Err(IssueFailure::AccessDenied));

        fs::create_dir(&watched).unwrap();
        if cfg!(unix) {
            assert_eq!(backend.issue_read(&dir), Err(IssueFailure::AccessDenied));
        }
        backend.close(dir);
    }

    #[test]
    fn removed_root_stays_dead_after_recreate() {
        let tmp = tempfile::tempdir().unwrap();
        let watched = tmp.path().join("watched");
        fs::create_dir(&watched).unwrap();

        let backend = NotifyBackend::new();
        let dir = backend.open_directory(&watched).unwrap();
        fs::remove_dir(&watched).unwrap();
        fs::create_dir(&watched).unwrap();

        // Reads accepted before the watcher reported the removal complete or get cancelled;
        // once the removal is seen the handle refuses for good.
        let until = Instant::now() + Duration::from_secs(5);
        let mut refused = false;
        while Instant::now() < until {
            match backend.issue_read(&dir) {
                Err(IssueFailure::AccessDenied) => {
                    refused = true;
                    break;
                }
                Err(other) => panic!("unexpected refusal {other:?}"),
                Ok(token) => {
                    if let WaitOutcome::TimedOut =
                        backend.wait_for_completion(&token, Duration::from_millis(50))
                    {
                        backend.cancel(&token);
                        backend.wait_for_completion(&token, Duration::from_millis(50));
                    }
                }
            }
        }
        assert!(refused, "handle over a removed root kept accepting reads");
        assert_eq!(backend.issue_read(&dir), Err(IssueFailure::AccessDenied));
        backend.close(dir);

        let fresh = backend.open_directory(&watched).unwrap();
        let token = backend.issue_read(&fresh).unwrap();
        fs::write(watched.join("after"), b"x").unwrap();
        match backend.wait_for_completion(&token, Duration::from_secs(5)) {
            WaitOutcome::Completed(batch) => assert!(!batch.is_empty()),
            other => panic!("expected completion on the reopened root, got {other:?}"),
        }
        backend.close(fresh);
    }

    #[test]
    fn issued_read_completes_with_events() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = NotifyBackend::new();
        let dir = backend.open_directory(tmp.path()).unwrap();

        let token = backend.issue_read(&dir).unwrap();
        fs::write(tmp.path().join("created"), b"x").unwrap();

        match backend.wait_for_completion(&token, Duration::from_secs(5)) {
            WaitOutcome::Completed(batch) => assert!(!batch.is_empty()),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(backend.issue_read(&dir).is_ok());
    }

    #[test]
    fn cancel_is_confirmed_on_next_wait() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = NotifyBackend::new();
        let dir = backend.open_directory(tmp.path()).unwrap();

        let token = backend.issue_read(&dir).unwrap();
        assert_eq!(backend.cancel(&token), CancelAck::Requested);
        assert_eq!(
            backend.wait_for_completion(&token, Duration::from_millis(100)),
            WaitOutcome::Cancelled
        );
        assert_eq!(backend.cancel(&token), CancelAck::NotPending);
        backend.close(dir);
    }

    #[test]
    fn missing_directory_cannot_be_opened() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = NotifyBackend::new();
        assert_eq!(
            backend.open_directory(&tmp.path().join("absent")),
            Err(OpenFailure::NotFound)
        );
    }
}
