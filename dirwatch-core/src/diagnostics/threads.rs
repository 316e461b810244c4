//! Worker registry used as the stack-introspection source for the hang oracle.
//!
//! Poller workers attach themselves on start and push a [`Frame`] around every blocking call. A
//! snapshot of the registry is the in-process equivalent of a thread dump: one entry per live
//! worker with the frames it is currently inside, oldest first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Frame {
    PollerLoop,
    IssueRead,
    /// Inside the notifier's completion wait, either for a read or for a cancel confirmation.
    AwaitCompletion,
    Teardown,
    Driver,
}

impl Frame {
    pub fn symbol(&self) -> &'static str {
        match self {
            Frame::PollerLoop => "poller_loop",
            Frame::IssueRead => "issue_read",
            Frame::AwaitCompletion => "wait_for_completion",
            Frame::Teardown => "teardown",
            Frame::Driver => "driver",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameSample {
    pub frame: Frame,
    pub entered_at: Instant,
}

impl FrameSample {
    pub fn elapsed(&self) -> Duration {
        self.entered_at.elapsed()
    }
}

#[derive(Clone, Debug)]
pub struct ThreadSnapshot {
    pub id: WorkerId,
    pub name: String,
    pub stack: Vec<FrameSample>,
}

/// Source of per-thread stack snapshots.
#[cfg_attr(test, mockall::automock)]
pub trait ThreadRegistry: Send + Sync {
    fn snapshot(&self) -> Vec<ThreadSnapshot>;
}

#[derive(Debug)]
struct WorkerEntry {
    name: String,
    stack: Vec<FrameSample>,
}

/// Live workers and their current frames.
#[derive(Default)]
pub struct WorkerRegistry {
    next_id: AtomicU64,
    workers: RwLock<BTreeMap<WorkerId, WorkerEntry>>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerRegistry");
        match self.workers.try_read() {
            Some(guard) => debug.field("live_workers", &guard.len()),
            None => debug.field("workers", &"<locked>"),
        };
        debug.finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling worker. The entry disappears when the guard drops.
    pub fn attach(self: &Arc<Self>, name: impl Into<String>) -> WorkerGuard {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.workers.write().insert(
            id,
            WorkerEntry {
                name: name.into(),
                stack: Vec::new(),
            },
        );
        WorkerGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn live_workers(&self) -> usize {
        self.workers.read().len()
    }

    fn push(&self, id: WorkerId, frame: Frame) {
        if let Some(entry) = self.workers.write().get_mut(&id) {
            entry.stack.push(FrameSample {
                frame,
                entered_at: Instant::now(),
            });
        }
    }

    fn pop(&self, id: WorkerId, frame: Frame) {
        if let Some(entry) = self.workers.write().get_mut(&id)
            && let Some(pos) = entry.stack.iter().rposition(|s| s.frame == frame)
        {
            entry.stack.truncate(pos);
        }
    }
}

impl ThreadRegistry for WorkerRegistry {
    fn snapshot(&self) -> Vec<ThreadSnapshot> {
        self.workers
            .read()
            .iter()
            .map(|(id, entry)| ThreadSnapshot {
                id: *id,
                name: entry.name.clone(),
                stack: entry.stack.clone(),
            })
            .collect()
    }
}

/// Registration of one worker thread.
pub struct WorkerGuard {
    registry: Arc<WorkerRegistry>,
    id: WorkerId,
}

impl WorkerGuard {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Push `frame` for as long as the returned guard lives.
    pub fn enter(&self, frame: Frame) -> FrameGuard<'_> {
        self.registry.push(self.id, frame);
        FrameGuard {
            worker: self,
            frame,
        }
    }
}

impl fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGuard").field("id", &self.id).finish()
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.registry.workers.write().remove(&self.id);
    }
}

#[derive(Debug)]
pub struct FrameGuard<'a> {
    worker: &'a WorkerGuard,
    frame: Frame,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.worker.registry.pop(self.worker.id, self.frame);
    }
}
