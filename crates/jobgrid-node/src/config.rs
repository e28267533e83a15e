use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use jobgrid_transport::{RetryConfig, TlsConfig};
use uuid::Uuid;

use crate::thread_manager::{ThreadManagerRegistry, MAX_PRIORITY, MIN_PRIORITY};

/// TLS material for the driver connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTls {
    pub ca: PathBuf,
    /// Client certificate, for drivers that require mutual TLS.
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Name the driver certificate must carry.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl NodeTls {
    pub fn load(&self) -> jobgrid_transport::Result<TlsConfig> {
        TlsConfig::from_files(&self.ca, self.cert.as_deref(), self.key.as_deref(), false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Driver node listener.
    pub driver: SocketAddr,
    pub tls: Option<NodeTls>,
    /// Worker threads executing tasks.
    pub threads: usize,
    pub thread_manager: String,
    /// Nice value applied to worker threads.
    pub priority: i32,
    /// Backoff between connection attempts. Leave `max_retries` unset to retry forever.
    pub retry: RetryConfig,
    /// Directory served to tasks as named resources.
    pub resource_dir: Option<PathBuf>,
    /// Fixed node identity; a random one is used when absent.
    pub uuid: Option<Uuid>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            driver: SocketAddr::from(([127, 0, 0, 1], 11112)),
            tls: None,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_manager: "pool".to_string(),
            priority: 0,
            retry: RetryConfig {
                max_retries: None,
                ..RetryConfig::default()
            },
            resource_dir: None,
            uuid: None,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            anyhow::bail!(
                "priority {} outside {}..={}",
                self.priority,
                MIN_PRIORITY,
                MAX_PRIORITY
            );
        }
        if !ThreadManagerRegistry::default()
            .names()
            .contains(&self.thread_manager)
        {
            anyhow::bail!("unknown thread manager: {}", self.thread_manager);
        }
        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("retry backoff_multiplier must be >= 1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.driver, SocketAddr::from(([127, 0, 0, 1], 11112)));
        assert!(config.threads >= 1);
        assert_eq!(config.thread_manager, "pool");
        assert_eq!(config.retry.max_retries, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
driver = "10.0.0.5:11112"
threads = 6
priority = 5
resource_dir = "/var/lib/jobgrid"
uuid = "6c8b8f63-5d2c-4a3b-9d7e-2f1a0c3b4d5e"

[tls]
ca = "/etc/jobgrid/ca.pem"
server_name = "driver.grid"

[retry]
max_retries = 10
initial_backoff = 250
            "#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.driver, SocketAddr::from(([10, 0, 0, 5], 11112)));
        assert_eq!(config.threads, 6);
        assert_eq!(config.priority, 5);
        assert_eq!(config.tls.as_ref().unwrap().server_name, "driver.grid");
        assert!(config.tls.as_ref().unwrap().cert.is_none());
        assert_eq!(config.retry.max_retries, Some(10));
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
        assert!(config.uuid.is_some());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "driver": "127.0.0.1:9000", "tls": {{ "ca": "ca.pem" }} }}"#
        )
        .unwrap();
        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.driver.port(), 9000);
        assert_eq!(config.tls.unwrap().server_name, "localhost");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero = NodeConfig {
            threads: 0,
            ..NodeConfig::default()
        };
        assert!(zero.validate().is_err());

        let loud = NodeConfig {
            priority: 40,
            ..NodeConfig::default()
        };
        assert!(loud.validate().is_err());

        let fibers = NodeConfig {
            thread_manager: "fibers".into(),
            ..NodeConfig::default()
        };
        assert!(fibers.validate().is_err());
    }
}
