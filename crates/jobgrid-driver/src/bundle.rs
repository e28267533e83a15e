//! Units of dispatch held by the job queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use jobgrid_transport::{BundleDispatch, JobHeader, TaskSpec};
use uuid::Uuid;

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

fn next_bundle_id() -> u64 {
    NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle flags of a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BundleFlags {
    /// The bundle came back from a node and was put on the queue again.
    pub requeue: bool,
    /// Dispatch is paused; the queue skips it.
    pub suspended: bool,
    pub cancelled: bool,
}

/// An ordered slice of one job's tasks.
#[derive(Debug, Clone)]
pub struct TaskBundle {
    pub id: u64,
    pub header: Arc<JobHeader>,
    pub tasks: Vec<TaskSpec>,
    /// Enqueue order; kept across requeues so a bundle keeps its place.
    pub(crate) seq: u64,
    pub entered_at: Option<Instant>,
    pub flags: BundleFlags,
}

impl TaskBundle {
    pub fn new(header: Arc<JobHeader>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: next_bundle_id(),
            header,
            tasks,
            seq: 0,
            entered_at: None,
            flags: BundleFlags::default(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.header.job_id
    }

    pub fn priority(&self) -> i32 {
        self.header.priority
    }

    pub fn uuid_path(&self) -> &[Uuid] {
        &self.header.uuid_path
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Keeps the first `count` tasks and returns the rest as a new bundle of the same
    /// job, or `None` when nothing is left over.
    pub fn split_off(&mut self, count: usize) -> Option<TaskBundle> {
        if count >= self.tasks.len() {
            return None;
        }
        let rest = self.tasks.split_off(count);
        Some(TaskBundle {
            id: next_bundle_id(),
            header: self.header.clone(),
            tasks: rest,
            seq: self.seq,
            entered_at: self.entered_at,
            flags: self.flags,
        })
    }

    /// Wire form sent to a node; the driver's own uuid is appended to the path.
    pub fn to_dispatch(&self, driver_uuid: Uuid) -> BundleDispatch {
        let mut uuid_path = self.header.uuid_path.clone();
        uuid_path.push(driver_uuid);
        BundleDispatch {
            bundle_id: self.id,
            job_id: self.header.job_id,
            uuid_path,
            tasks: self.tasks.clone(),
        }
    }
}
