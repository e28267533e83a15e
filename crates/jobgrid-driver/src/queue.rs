//! Priority queue of task bundles waiting for a node.
//!
//! Bundles are ordered by job priority (higher first), then by enqueue order. A bundle
//! that is split or put back keeps its original position. Listeners are notified
//! synchronously after the bundle is visible to `dequeue`, outside the queue lock.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Serialize;
use tracing::trace;
use uuid::Uuid;

use crate::bundle::TaskBundle;

/// What a listener learns about a newly queued bundle.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub job_id: Uuid,
    pub bundle_id: u64,
    pub task_count: usize,
    pub priority: i32,
    /// The bundle was put back rather than submitted.
    pub requeued: bool,
    pub uuid_path: Vec<Uuid>,
}

pub trait QueueListener: Send + Sync {
    fn bundle_added(&self, event: &QueueEvent);
}

pub type QueueListenerId = u64;

type QueueKey = (Reverse<i32>, u64, u64);

#[derive(Default)]
struct QueueStats {
    bundles_enqueued: AtomicU64,
    bundles_requeued: AtomicU64,
    bundles_dequeued: AtomicU64,
    tasks_enqueued: AtomicU64,
    tasks_dequeued: AtomicU64,
    total_wait_us: AtomicU64,
    max_wait_us: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatsSnapshot {
    pub bundles_enqueued: u64,
    pub bundles_requeued: u64,
    pub bundles_dequeued: u64,
    pub tasks_enqueued: u64,
    pub tasks_dequeued: u64,
    pub total_wait_us: u64,
    pub max_wait_us: u64,
    pub queued_bundles: usize,
    pub queued_tasks: usize,
}

impl QueueStatsSnapshot {
    pub fn mean_wait_us(&self) -> u64 {
        if self.bundles_dequeued == 0 {
            0
        } else {
            self.total_wait_us / self.bundles_dequeued
        }
    }
}

#[derive(Default)]
struct QueueInner {
    bundles: BTreeMap<QueueKey, TaskBundle>,
    task_count: usize,
}

#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    listeners: RwLock<Vec<(QueueListenerId, Arc<dyn QueueListener>)>>,
    next_seq: AtomicU64,
    next_listener: AtomicU64,
    stats: QueueStats,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new bundle at the back of its priority level.
    pub fn enqueue(&self, mut bundle: TaskBundle) {
        bundle.seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.bundles_enqueued.fetch_add(1, Ordering::Relaxed);
        self.stats
            .tasks_enqueued
            .fetch_add(bundle.task_count() as u64, Ordering::Relaxed);
        self.insert(bundle, false);
    }

    /// Puts a bundle back at the position it originally had.
    pub fn requeue(&self, mut bundle: TaskBundle) {
        if bundle.seq == 0 {
            bundle.seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        }
        bundle.flags.requeue = true;
        self.stats.bundles_requeued.fetch_add(1, Ordering::Relaxed);
        self.insert(bundle, true);
    }

    fn insert(&self, mut bundle: TaskBundle, requeued: bool) {
        if bundle.is_empty() {
            return;
        }
        bundle.entered_at = Some(Instant::now());
        let event = QueueEvent {
            job_id: bundle.job_id(),
            bundle_id: bundle.id,
            task_count: bundle.task_count(),
            priority: bundle.priority(),
            requeued,
            uuid_path: bundle.uuid_path().to_vec(),
        };
        {
            let mut inner = self.inner.lock().unwrap();
            inner.task_count += bundle.task_count();
            let key = (Reverse(bundle.priority()), bundle.seq, bundle.id);
            inner.bundles.insert(key, bundle);
        }
        trace!(job_id = %event.job_id, bundle_id = event.bundle_id, tasks = event.task_count, requeued, "bundle queued");

        let listeners: Vec<Arc<dyn QueueListener>> = self
            .listeners
            .read()
            .unwrap()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener.bundle_added(&event);
        }
    }

    /// Removes and returns the head bundle, skipping suspended ones.
    pub fn dequeue(&self) -> Option<TaskBundle> {
        let bundle = {
            let mut inner = self.inner.lock().unwrap();
            let key = inner
                .bundles
                .iter()
                .find(|(_, bundle)| !bundle.flags.suspended)
                .map(|(key, _)| *key)?;
            let bundle = inner.bundles.remove(&key)?;
            inner.task_count -= bundle.task_count();
            bundle
        };

        let waited = bundle
            .entered_at
            .map(|at| at.elapsed().as_micros() as u64)
            .unwrap_or(0);
        self.stats.bundles_dequeued.fetch_add(1, Ordering::Relaxed);
        self.stats
            .tasks_dequeued
            .fetch_add(bundle.task_count() as u64, Ordering::Relaxed);
        self.stats.total_wait_us.fetch_add(waited, Ordering::Relaxed);
        self.stats.max_wait_us.fetch_max(waited, Ordering::Relaxed);
        Some(bundle)
    }

    /// Drops every queued bundle of a job. Returns the number of tasks removed.
    pub fn remove_job(&self, job_id: Uuid) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = 0;
        inner.bundles.retain(|_, bundle| {
            if bundle.job_id() == job_id {
                removed += bundle.task_count();
                false
            } else {
                true
            }
        });
        inner.task_count -= removed;
        removed
    }

    /// Pauses or resumes dispatch of a job's queued bundles.
    pub fn set_suspended(&self, job_id: Uuid, suspended: bool) -> usize {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            let mut changed = 0;
            for bundle in inner.bundles.values_mut() {
                if bundle.job_id() == job_id && bundle.flags.suspended != suspended {
                    bundle.flags.suspended = suspended;
                    changed += 1;
                }
            }
            changed
        };
        if changed > 0 && !suspended {
            // resumed work is new work for idle nodes
            let listeners: Vec<Arc<dyn QueueListener>> = self
                .listeners
                .read()
                .unwrap()
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            let event = QueueEvent {
                job_id,
                bundle_id: 0,
                task_count: 0,
                priority: 0,
                requeued: true,
                uuid_path: Vec::new(),
            };
            for listener in listeners {
                listener.bundle_added(&event);
            }
        }
        changed
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) -> QueueListenerId {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed) + 1;
        self.listeners.write().unwrap().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: QueueListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Number of queued bundles.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock().unwrap().task_count
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        let (queued_bundles, queued_tasks) = {
            let inner = self.inner.lock().unwrap();
            (inner.bundles.len(), inner.task_count)
        };
        QueueStatsSnapshot {
            bundles_enqueued: self.stats.bundles_enqueued.load(Ordering::Relaxed),
            bundles_requeued: self.stats.bundles_requeued.load(Ordering::Relaxed),
            bundles_dequeued: self.stats.bundles_dequeued.load(Ordering::Relaxed),
            tasks_enqueued: self.stats.tasks_enqueued.load(Ordering::Relaxed),
            tasks_dequeued: self.stats.tasks_dequeued.load(Ordering::Relaxed),
            total_wait_us: self.stats.total_wait_us.load(Ordering::Relaxed),
            max_wait_us: self.stats.max_wait_us.load(Ordering::Relaxed),
            queued_bundles,
            queued_tasks,
        }
    }
}
