use super::{clamp_size, Bundler, BundlerSettings};

/// Always the configured size.
pub struct ManualBundler {
    size: usize,
    max_size: usize,
}

impl ManualBundler {
    pub fn new(settings: &BundlerSettings) -> Self {
        Self {
            size: clamp_size(settings.size as f64, settings.max_size),
            max_size: settings.max_size,
        }
    }
}

impl Bundler for ManualBundler {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn next_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, _task_count: usize, _elapsed_nanos: u64) {}

    fn max_size(&self) -> usize {
        self.max_size
    }
}
