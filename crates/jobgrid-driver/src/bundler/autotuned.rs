use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{clamp_size, Bundler, BundlerSettings};

const MIN_TEMPERATURE: f64 = 0.05;

#[derive(Debug, Default, Clone, Copy)]
struct SizeSample {
    total_nanos: f64,
    tasks: f64,
}

impl SizeSample {
    fn mean(&self) -> f64 {
        if self.tasks == 0.0 {
            f64::INFINITY
        } else {
            self.total_nanos / self.tasks
        }
    }
}

/// Simulated annealing over bundle sizes.
///
/// Stays at a candidate size for `min_samples` rounds, compares its mean per-task time
/// with the best size so far, then jumps to a random size around the best one. Jumps
/// shrink as the temperature decays; a worse candidate may still be adopted with a
/// probability that also shrinks with the temperature.
pub struct AutotunedBundler {
    samples: HashMap<usize, SizeSample>,
    current: usize,
    best: usize,
    rounds_at_current: usize,
    temperature: f64,
    min_samples: usize,
    max_deviation: f64,
    decrease_ratio: f64,
    max_size: usize,
    rng: StdRng,
}

impl AutotunedBundler {
    pub fn new(settings: &BundlerSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    pub fn with_seed(settings: &BundlerSettings, seed: u64) -> Self {
        Self::with_rng(settings, StdRng::seed_from_u64(seed))
    }

    fn with_rng(settings: &BundlerSettings, rng: StdRng) -> Self {
        let start = clamp_size(settings.size as f64, settings.max_size);
        Self {
            samples: HashMap::new(),
            current: start,
            best: start,
            rounds_at_current: 0,
            temperature: 1.0,
            min_samples: settings.min_samples.max(1),
            max_deviation: settings.max_deviation,
            decrease_ratio: settings.decrease_ratio,
            max_size: settings.max_size,
            rng,
        }
    }

    pub fn best_size(&self) -> usize {
        self.best
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    fn mean_at(&self, size: usize) -> f64 {
        self.samples.get(&size).map(SizeSample::mean).unwrap_or(f64::INFINITY)
    }

    fn anneal(&mut self) {
        let candidate = self.mean_at(self.current);
        let best = self.mean_at(self.best);
        if candidate < best {
            self.best = self.current;
        } else if candidate.is_finite() && best.is_finite() && best > 0.0 {
            let worse_by = (candidate - best) / best;
            if self.rng.gen::<f64>() < (-worse_by / self.temperature).exp() {
                self.best = self.current;
            }
        }

        self.temperature = (self.temperature * self.decrease_ratio).max(MIN_TEMPERATURE);
        let reach = (self.best as f64 * self.max_deviation * self.temperature).round().max(1.0) as i64;
        let delta = self.rng.gen_range(-reach..=reach);
        self.current = clamp_size((self.best as i64 + delta) as f64, self.max_size);
        self.rounds_at_current = 0;
    }
}

impl Bundler for AutotunedBundler {
    fn name(&self) -> &'static str {
        "autotuned"
    }

    fn next_size(&self) -> usize {
        self.current
    }

    fn feedback(&mut self, task_count: usize, elapsed_nanos: u64) {
        if task_count == 0 {
            return;
        }
        let sample = self.samples.entry(self.current).or_default();
        sample.total_nanos += elapsed_nanos as f64;
        sample.tasks += task_count as f64;
        self.rounds_at_current += 1;
        if self.rounds_at_current >= self.min_samples {
            self.anneal();
        }
    }

    fn max_size(&self) -> usize {
        self.max_size
    }

    fn dispose(&mut self) {
        self.samples.clear();
    }
}
