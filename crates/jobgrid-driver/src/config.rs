use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use jobgrid_transport::{TlsConfig, TransitionMode};

use crate::bundler::{BundlerRegistry, BundlerSettings};

/// PEM files for the driver's TLS listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsFiles {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub require_client_auth: bool,
}

impl TlsFiles {
    pub fn load(&self) -> jobgrid_transport::Result<TlsConfig> {
        TlsConfig::from_files(
            &self.ca,
            Some(&self.cert),
            Some(&self.key),
            self.require_client_auth,
        )
    }
}

/// How channel transitions are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum ModeConfig {
    Sequential,
    Parallel { workers: usize },
}

impl Default for ModeConfig {
    fn default() -> Self {
        ModeConfig::Parallel { workers: 16 }
    }
}

impl From<ModeConfig> for TransitionMode {
    fn from(mode: ModeConfig) -> Self {
        match mode {
            ModeConfig::Sequential => TransitionMode::Sequential,
            ModeConfig::Parallel { workers } => TransitionMode::Parallel { workers },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Plain listeners for job clients.
    pub client_listen: Vec<SocketAddr>,
    /// Plain listeners for nodes and peer drivers.
    pub node_listen: Vec<SocketAddr>,
    pub client_tls_listen: Vec<SocketAddr>,
    pub node_tls_listen: Vec<SocketAddr>,
    /// Required when any TLS listener is configured.
    pub tls: Option<TlsFiles>,
    /// Upper bound on the multiplexer's wait for readiness.
    pub select_timeout_ms: u64,
    pub mode: ModeConfig,
    pub bundler: BundlerSettings,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            client_listen: vec![SocketAddr::from(([0, 0, 0, 0], 11111))],
            node_listen: vec![SocketAddr::from(([0, 0, 0, 0], 11112))],
            client_tls_listen: Vec::new(),
            node_tls_listen: Vec::new(),
            tls: None,
            select_timeout_ms: 1000,
            mode: ModeConfig::default(),
            bundler: BundlerSettings::default(),
        }
    }
}

impl DriverConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: DriverConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let wants_tls = !self.client_tls_listen.is_empty() || !self.node_tls_listen.is_empty();
        if wants_tls && self.tls.is_none() {
            anyhow::bail!("TLS listeners configured without a [tls] section");
        }
        if let ModeConfig::Parallel { workers: 0 } = self.mode {
            anyhow::bail!("parallel mode needs at least one worker");
        }
        BundlerRegistry::default().create(&self.bundler)?;
        Ok(())
    }

    pub fn select_timeout(&self) -> Option<Duration> {
        (self.select_timeout_ms > 0).then(|| Duration::from_millis(self.select_timeout_ms))
    }
}
