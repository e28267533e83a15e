use std::collections::VecDeque;

use super::{clamp_size, Bundler, BundlerSettings, NodeProfile};

/// Sizes rounds so that one round takes about `target_round_ms`, using the mean
/// per-task time over a sliding window of recent rounds.
pub struct ProportionalBundler {
    window: VecDeque<f64>,
    capacity: usize,
    target_nanos: f64,
    initial: usize,
    max_size: usize,
    threads: u32,
}

impl ProportionalBundler {
    pub fn new(settings: &BundlerSettings) -> Self {
        Self {
            window: VecDeque::with_capacity(settings.window),
            capacity: settings.window.max(1),
            target_nanos: settings.target_round_ms as f64 * 1_000_000.0,
            initial: settings.size,
            max_size: settings.max_size,
            threads: 1,
        }
    }

    /// Mean nanoseconds per task over the window, if any round was recorded.
    pub fn mean_task_nanos(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }
}

impl Bundler for ProportionalBundler {
    fn name(&self) -> &'static str {
        "proportional"
    }

    fn next_size(&self) -> usize {
        match self.mean_task_nanos() {
            None => clamp_size(self.initial as f64, self.max_size),
            Some(mean) if mean <= 0.0 => self.max_size.max(1),
            // tasks of a round run in parallel on the node's threads
            Some(mean) => clamp_size(self.target_nanos / mean * self.threads as f64, self.max_size),
        }
    }

    fn feedback(&mut self, task_count: usize, elapsed_nanos: u64) {
        if task_count == 0 {
            return;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        let per_task = elapsed_nanos as f64 / task_count as f64 * self.threads.min(task_count as u32) as f64;
        self.window.push_back(per_task);
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn setup(&mut self, profile: &NodeProfile) {
        self.threads = profile.processing_threads.max(1);
    }

    fn dispose(&mut self) {
        self.window.clear();
    }
}
