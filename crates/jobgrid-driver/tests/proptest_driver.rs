//! Property-based tests for the job queue, bundle slicing and bundlers.

use jobgrid_driver::{
    select_bundle, BundlerReference, BundlerRegistry, BundlerSettings, Dispatch, JobQueue,
    NodeProfile, TaskBundle,
};
use jobgrid_transport::{JobHeader, TaskSpec};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

fn job(priority: i32, count: u32) -> TaskBundle {
    let header = Arc::new(JobHeader {
        job_id: Uuid::new_v4(),
        name: "prop".into(),
        priority,
        metadata: BTreeMap::new(),
        uuid_path: Vec::new(),
    });
    let tasks = (0..count)
        .map(|position| TaskSpec {
            position,
            kind: "echo".into(),
            payload: Vec::new(),
            timeout: None,
        })
        .collect();
    TaskBundle::new(header, tasks)
}

fn any_algorithm() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("manual"),
        Just("proportional"),
        Just("autotuned"),
        Just("nodethreads"),
    ]
}

proptest! {
    /// Every task submitted is dispatched exactly once, whatever the slice sizes.
    #[test]
    fn test_tasks_dispatched_exactly_once(
        jobs in prop::collection::vec((-3i32..3, 1u32..40), 1..8),
        sizes in prop::collection::vec(1usize..12, 1..20),
    ) {
        let queue = JobQueue::new();
        let mut expected = 0usize;
        for (priority, count) in &jobs {
            queue.enqueue(job(*priority, *count));
            expected += *count as usize;
        }

        let peer = Uuid::new_v4();
        let mut seen = HashSet::new();
        let mut round = 0;
        loop {
            let size = sizes[round % sizes.len()];
            round += 1;
            match select_bundle(&queue, size, peer) {
                Dispatch::Send(bundle) => {
                    prop_assert!(bundle.task_count() <= size);
                    prop_assert!(bundle.task_count() >= 1);
                    for task in &bundle.tasks {
                        prop_assert!(seen.insert((bundle.job_id(), task.position)));
                    }
                }
                Dispatch::Empty => break,
                Dispatch::Cycle { .. } => prop_assert!(false, "no cycles without a path"),
            }
        }
        prop_assert_eq!(seen.len(), expected);
        prop_assert!(queue.is_empty());
    }

    /// Higher priority work is always dispatched before lower priority work.
    #[test]
    fn test_priority_order(priorities in prop::collection::vec(-5i32..5, 1..10)) {
        let queue = JobQueue::new();
        for priority in &priorities {
            queue.enqueue(job(*priority, 2));
        }
        let mut last = i32::MAX;
        while let Some(bundle) = queue.dequeue() {
            prop_assert!(bundle.priority() <= last);
            last = bundle.priority();
        }
    }

    /// Sizes stay in `[1, max]` under any feedback, including degenerate timings.
    #[test]
    fn test_bundler_size_bounds(
        algorithm in any_algorithm(),
        max_size in 1usize..200,
        size in 1usize..300,
        threads in 1u32..64,
        rounds in prop::collection::vec((0usize..500, prop_oneof![Just(0u64), Just(u64::MAX), 0u64..10_000_000_000]), 0..50),
    ) {
        let settings = BundlerSettings {
            algorithm: algorithm.to_string(),
            max_size,
            size,
            ..BundlerSettings::default()
        };
        let reference = BundlerReference::new(Arc::new(BundlerRegistry::default()), settings).unwrap();
        let mut bundler = reference
            .new_channel_bundler(NodeProfile { processing_threads: threads })
            .unwrap();
        let next = bundler.next_size();
        prop_assert!((1..=max_size).contains(&next));
        for (tasks, elapsed) in rounds {
            bundler.feedback(tasks, elapsed);
            let next = bundler.next_size();
            prop_assert!((1..=max_size).contains(&next), "{} gave {}", algorithm, next);
        }
    }
}
