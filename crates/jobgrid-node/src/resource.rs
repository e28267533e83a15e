//! Opaque resources that tasks can look up by name.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

pub trait ResourceProvider: Send + Sync {
    /// Returns the named resource, or `None` if the provider does not have it.
    fn resource(&self, name: &str) -> Option<Vec<u8>>;
}

/// Provider with nothing in it.
pub struct NoResources;

impl ResourceProvider for NoResources {
    fn resource(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// In-memory provider, mostly for tests and embedded nodes.
#[derive(Default)]
pub struct MemoryResources {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        self.entries.write().unwrap().insert(name.into(), data);
    }
}

impl ResourceProvider for MemoryResources {
    fn resource(&self, name: &str) -> Option<Vec<u8>> {
        self.entries.read().unwrap().get(name).cloned()
    }
}

/// Serves files below a root directory. Names are relative paths; anything that
/// would escape the root is refused.
pub struct DirectoryResources {
    root: PathBuf,
}

impl DirectoryResources {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl ResourceProvider for DirectoryResources {
    fn resource(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.resolve(name)?;
        match std::fs::read(&path) {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::debug!(resource = name, error = %e, "resource not readable");
                None
            }
        }
    }
}
