use super::{clamp_size, Bundler, BundlerSettings, NodeProfile};

/// Node processing threads times a multiplicator.
pub struct NodeThreadsBundler {
    multiplicator: u32,
    threads: u32,
    max_size: usize,
}

impl NodeThreadsBundler {
    pub fn new(settings: &BundlerSettings) -> Self {
        Self {
            multiplicator: settings.multiplicator,
            threads: 1,
            max_size: settings.max_size,
        }
    }
}

impl Bundler for NodeThreadsBundler {
    fn name(&self) -> &'static str {
        "nodethreads"
    }

    fn next_size(&self) -> usize {
        clamp_size(
            self.threads as f64 * self.multiplicator as f64,
            self.max_size,
        )
    }

    fn feedback(&mut self, _task_count: usize, _elapsed_nanos: u64) {}

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn setup(&mut self, profile: &NodeProfile) {
        self.threads = profile.processing_threads.max(1);
    }
}
