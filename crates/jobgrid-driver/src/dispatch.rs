//! Choosing the next slice of work for a node.

use tracing::debug;
use uuid::Uuid;

use crate::bundle::TaskBundle;
use crate::queue::JobQueue;

#[derive(Debug)]
pub enum Dispatch {
    /// A slice of at most the requested size; any remainder is back on the queue.
    Send(TaskBundle),
    /// The head bundle already went through the node's peer; it was put back unchanged.
    Cycle { bundle_id: u64, task_count: usize },
    Empty,
}

/// Takes the head bundle and cuts it down to `size` tasks.
///
/// `peer` is the uuid the node announced. A bundle whose path already contains it is
/// returned to the queue whole and no slice is produced.
pub fn select_bundle(queue: &JobQueue, size: usize, peer: Uuid) -> Dispatch {
    let Some(mut bundle) = queue.dequeue() else {
        return Dispatch::Empty;
    };

    if bundle.uuid_path().contains(&peer) {
        let (bundle_id, task_count) = (bundle.id, bundle.task_count());
        debug!(
            bundle_id,
            job_id = %bundle.job_id(),
            %peer,
            "cycle detected in bundle routing, requeueing"
        );
        queue.requeue(bundle);
        return Dispatch::Cycle {
            bundle_id,
            task_count,
        };
    }

    if let Some(rest) = bundle.split_off(size.max(1)) {
        queue.requeue(rest);
    }
    Dispatch::Send(bundle)
}
