//! Adaptive bundle sizing.
//!
//! Every node channel owns a [`ChannelBundler`]. It is built from the driver-wide
//! [`BundlerReference`] and re-copied when the reference's version moves, unless the
//! channel has been pinned to a specific bundler. Strategies are resolved by name through
//! a [`BundlerRegistry`].

mod autotuned;
mod manual;
mod nodethreads;
mod proportional;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BundlerError;

pub use autotuned::AutotunedBundler;
pub use manual::ManualBundler;
pub use nodethreads::NodeThreadsBundler;
pub use proportional::ProportionalBundler;

/// What a bundler knows about the node it sizes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeProfile {
    pub processing_threads: u32,
}

impl Default for NodeProfile {
    fn default() -> Self {
        Self {
            processing_threads: 1,
        }
    }
}

/// Sizing strategy for one node channel.
pub trait Bundler: Send {
    fn name(&self) -> &'static str;

    /// Tasks to send in the next round. Callers clamp to `[1, max_size]`.
    fn next_size(&self) -> usize;

    /// Records a finished round.
    fn feedback(&mut self, task_count: usize, elapsed_nanos: u64);

    fn max_size(&self) -> usize;

    fn setup(&mut self, _profile: &NodeProfile) {}

    fn dispose(&mut self) {}
}

/// Keeps a computed size inside `[1, max]`.
pub fn clamp_size(size: f64, max: usize) -> usize {
    let max = max.max(1);
    if !size.is_finite() {
        return if size.is_sign_negative() { 1 } else { max };
    }
    (size.round().max(1.0) as usize).min(max)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BundlerSettings {
    pub algorithm: String,
    pub max_size: usize,
    /// Fixed size for `manual`, starting size for the adaptive strategies.
    pub size: usize,
    /// `proportional`: rounds kept in the sliding window.
    pub window: usize,
    /// `proportional`: round duration the size aims for.
    pub target_round_ms: u64,
    /// `autotuned`: rounds observed at one size before moving on.
    pub min_samples: usize,
    /// `autotuned`: largest relative jump away from the best size.
    pub max_deviation: f64,
    /// `autotuned`: temperature decay per move, in `(0, 1]`.
    pub decrease_ratio: f64,
    /// `nodethreads`: tasks per processing thread.
    pub multiplicator: u32,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            algorithm: "proportional".to_string(),
            max_size: 100,
            size: 5,
            window: 16,
            target_round_ms: 1000,
            min_samples: 3,
            max_deviation: 0.5,
            decrease_ratio: 0.9,
            multiplicator: 1,
        }
    }
}

impl BundlerSettings {
    pub fn manual(size: usize, max_size: usize) -> Self {
        Self {
            algorithm: "manual".to_string(),
            size,
            max_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), BundlerError> {
        let invalid = |name: &str, reason: &str| BundlerError::InvalidParameter {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if self.max_size == 0 {
            return Err(invalid("max_size", "must be at least 1"));
        }
        if self.size == 0 {
            return Err(invalid("size", "must be at least 1"));
        }
        if self.window == 0 {
            return Err(invalid("window", "must be at least 1"));
        }
        if self.min_samples == 0 {
            return Err(invalid("min_samples", "must be at least 1"));
        }
        if !(self.max_deviation > 0.0 && self.max_deviation.is_finite()) {
            return Err(invalid("max_deviation", "must be a positive number"));
        }
        if !(self.decrease_ratio > 0.0 && self.decrease_ratio <= 1.0) {
            return Err(invalid("decrease_ratio", "must be in (0, 1]"));
        }
        if self.multiplicator == 0 {
            return Err(invalid("multiplicator", "must be at least 1"));
        }
        Ok(())
    }
}

pub type BundlerConstructor = fn(&BundlerSettings) -> Box<dyn Bundler>;

/// Named bundler constructors.
#[derive(Clone)]
pub struct BundlerRegistry {
    constructors: HashMap<String, BundlerConstructor>,
}

impl Default for BundlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("manual", |s| Box::new(ManualBundler::new(s)));
        registry.register("proportional", |s| Box::new(ProportionalBundler::new(s)));
        registry.register("autotuned", |s| Box::new(AutotunedBundler::new(s)));
        registry.register("nodethreads", |s| Box::new(NodeThreadsBundler::new(s)));
        registry
    }
}

impl BundlerRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, constructor: BundlerConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    pub fn create(&self, settings: &BundlerSettings) -> Result<Box<dyn Bundler>, BundlerError> {
        settings.validate()?;
        let constructor = self
            .constructors
            .get(&settings.algorithm)
            .ok_or_else(|| BundlerError::UnknownAlgorithm(settings.algorithm.clone()))?;
        Ok(constructor(settings))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Driver-wide bundler configuration that channels copy from.
///
/// `update` stores the new settings before bumping the version, so a reader that sees
/// a version always finds settings at least that new.
pub struct BundlerReference {
    registry: Arc<BundlerRegistry>,
    settings: RwLock<Arc<BundlerSettings>>,
    version: AtomicU64,
}

impl BundlerReference {
    pub fn new(registry: Arc<BundlerRegistry>, settings: BundlerSettings) -> Result<Self, BundlerError> {
        registry.create(&settings)?;
        Ok(Self {
            registry,
            settings: RwLock::new(Arc::new(settings)),
            version: AtomicU64::new(1),
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> Arc<BundlerSettings> {
        self.settings.read().unwrap().clone()
    }

    pub fn registry(&self) -> &Arc<BundlerRegistry> {
        &self.registry
    }

    /// Replaces the settings. Channels pick them up before their next round.
    pub fn update(&self, settings: BundlerSettings) -> Result<u64, BundlerError> {
        self.registry.create(&settings)?;
        *self.settings.write().unwrap() = Arc::new(settings);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(version, "bundler settings updated");
        Ok(version)
    }

    pub fn new_channel_bundler(&self, profile: NodeProfile) -> Result<ChannelBundler, BundlerError> {
        let version = self.version();
        let mut inner = self.registry.create(&self.settings())?;
        inner.setup(&profile);
        Ok(ChannelBundler {
            inner,
            version,
            overridden: false,
            profile,
        })
    }
}

/// The bundler owned by one node channel.
pub struct ChannelBundler {
    inner: Box<dyn Bundler>,
    version: u64,
    overridden: bool,
    profile: NodeProfile,
}

impl ChannelBundler {
    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden
    }

    pub fn profile(&self) -> NodeProfile {
        self.profile
    }

    /// Re-copies the reference if it moved and this channel is not pinned.
    /// Returns `true` when the bundler was replaced.
    pub fn refresh(&mut self, reference: &BundlerReference) -> bool {
        if self.overridden {
            return false;
        }
        let version = reference.version();
        if version <= self.version {
            return false;
        }
        match reference.registry().create(&reference.settings()) {
            Ok(mut fresh) => {
                self.inner.dispose();
                fresh.setup(&self.profile);
                debug!(from = self.inner.name(), to = fresh.name(), version, "bundler replaced");
                self.inner = fresh;
                self.version = version;
                true
            }
            Err(e) => {
                warn!(version, error = %e, "keeping current bundler");
                self.version = version;
                false
            }
        }
    }

    /// Pins this channel to `bundler`; reference updates are ignored until `unpin`.
    pub fn pin(&mut self, mut bundler: Box<dyn Bundler>) {
        self.inner.dispose();
        bundler.setup(&self.profile);
        self.inner = bundler;
        self.overridden = true;
    }

    /// Follows the reference again from the next refresh.
    pub fn unpin(&mut self) {
        self.overridden = false;
        self.version = 0;
    }

    pub fn next_size(&self) -> usize {
        clamp_size(self.inner.next_size() as f64, self.inner.max_size())
    }

    pub fn feedback(&mut self, task_count: usize, elapsed_nanos: u64) {
        if task_count > 0 {
            self.inner.feedback(task_count, elapsed_nanos);
        }
    }

    pub fn update_profile(&mut self, profile: NodeProfile) {
        if profile != self.profile {
            self.profile = profile;
            self.inner.setup(&profile);
        }
    }
}

impl Drop for ChannelBundler {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(settings: BundlerSettings) -> BundlerReference {
        BundlerReference::new(Arc::new(BundlerRegistry::default()), settings).unwrap()
    }

    #[test]
    fn test_clamp_size() {
        assert_eq!(clamp_size(0.0, 10), 1);
        assert_eq!(clamp_size(-5.0, 10), 1);
        assert_eq!(clamp_size(50.0, 10), 10);
        assert_eq!(clamp_size(f64::INFINITY, 10), 10);
        assert_eq!(clamp_size(3.4, 10), 3);
        assert_eq!(clamp_size(3.0, 0), 1);
    }

    #[test]
    fn test_registry_builtins() {
        let registry = BundlerRegistry::default();
        assert_eq!(
            registry.names(),
            vec!["autotuned", "manual", "nodethreads", "proportional"]
        );
        for name in registry.names() {
            let settings = BundlerSettings {
                algorithm: name.clone(),
                ..BundlerSettings::default()
            };
            assert_eq!(registry.create(&settings).unwrap().name(), name);
        }
    }

    #[test]
    fn test_registry_rejects_unknown_and_invalid() {
        let registry = BundlerRegistry::default();
        let unknown = BundlerSettings {
            algorithm: "nope".into(),
            ..BundlerSettings::default()
        };
        assert!(matches!(
            registry.create(&unknown),
            Err(BundlerError::UnknownAlgorithm(_))
        ));
        let invalid = BundlerSettings {
            max_size: 0,
            ..BundlerSettings::default()
        };
        assert!(matches!(
            registry.create(&invalid),
            Err(BundlerError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_registry_custom_constructor() {
        let mut registry = BundlerRegistry::empty();
        registry.register("always-max", |s| Box::new(ManualBundler::new(&BundlerSettings::manual(s.max_size, s.max_size))));
        let settings = BundlerSettings {
            algorithm: "always-max".into(),
            max_size: 7,
            ..BundlerSettings::default()
        };
        assert_eq!(registry.create(&settings).unwrap().next_size(), 7);
    }

    #[test]
    fn test_channel_refreshes_when_stale() {
        let reference = reference(BundlerSettings::manual(2, 10));
        let mut channel = reference.new_channel_bundler(NodeProfile::default()).unwrap();
        assert_eq!(channel.next_size(), 2);
        assert!(!channel.refresh(&reference));

        reference.update(BundlerSettings::manual(6, 10)).unwrap();
        assert!(channel.refresh(&reference));
        assert_eq!(channel.next_size(), 6);
        assert!(!channel.refresh(&reference));
    }

    #[test]
    fn test_pinned_channel_ignores_updates() {
        let reference = reference(BundlerSettings::manual(2, 10));
        let mut channel = reference.new_channel_bundler(NodeProfile::default()).unwrap();
        channel.pin(Box::new(ManualBundler::new(&BundlerSettings::manual(9, 10))));
        reference.update(BundlerSettings::manual(4, 10)).unwrap();
        assert!(!channel.refresh(&reference));
        assert_eq!(channel.next_size(), 9);

        channel.unpin();
        assert!(channel.refresh(&reference));
        assert_eq!(channel.next_size(), 4);
    }

    #[test]
    fn test_invalid_update_rejected() {
        let reference = reference(BundlerSettings::default());
        let before = reference.version();
        assert!(reference
            .update(BundlerSettings {
                algorithm: "missing".into(),
                ..BundlerSettings::default()
            })
            .is_err());
        assert_eq!(reference.version(), before);
    }

    #[test]
    fn test_settings_from_json_defaults() {
        let settings: BundlerSettings =
            serde_json::from_str(r#"{"algorithm":"autotuned","max_size":40}"#).unwrap();
        assert_eq!(settings.algorithm, "autotuned");
        assert_eq!(settings.max_size, 40);
        assert_eq!(settings.window, 16);
    }
}
