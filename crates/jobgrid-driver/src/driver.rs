//! The driver process: one job queue served to clients and nodes by two multiplexers.

use std::net::SocketAddr;
use std::sync::Arc;

use jobgrid_transport::{
    tls, ChannelId, ConnectionMultiplexer, MetricsSnapshot, MultiplexerConfig, MultiplexerHandle,
    TlsConfig,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::bundler::{BundlerReference, BundlerRegistry, BundlerSettings};
use crate::client_server::ClientServer;
use crate::config::DriverConfig;
use crate::error::Result;
use crate::job::{JobInfo, JobRegistry};
use crate::node_server::{NodeInfo, NodeServer};
use crate::queue::{JobQueue, QueueStatsSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct DriverStats {
    pub queue: QueueStatsSnapshot,
    pub clients: MetricsSnapshot,
    pub nodes: MetricsSnapshot,
    pub active_jobs: usize,
    pub idle_nodes: usize,
    pub bundler_version: u64,
}

pub struct Driver {
    uuid: Uuid,
    queue: Arc<JobQueue>,
    jobs: Arc<JobRegistry>,
    reference: Arc<BundlerReference>,
    node_server: Arc<NodeServer>,
    clients: MultiplexerHandle,
    nodes: MultiplexerHandle,
    client_addrs: Vec<SocketAddr>,
    client_tls_addrs: Vec<SocketAddr>,
    node_addrs: Vec<SocketAddr>,
    node_tls_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl Driver {
    /// Binds every listener and starts serving. TLS material is read from the files
    /// named in `config.tls`.
    pub async fn start(config: DriverConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(files) => Some(files.load()?),
            None => None,
        };
        Self::start_with(config, BundlerRegistry::default(), tls).await
    }

    /// Like [`Driver::start`] with an explicit bundler registry and in-memory TLS material.
    pub async fn start_with(
        config: DriverConfig,
        registry: BundlerRegistry,
        tls: Option<TlsConfig>,
    ) -> Result<Self> {
        let uuid = Uuid::new_v4();
        let queue = Arc::new(JobQueue::new());
        let jobs = Arc::new(JobRegistry::new(queue.clone()));
        let reference = Arc::new(BundlerReference::new(
            Arc::new(registry),
            config.bundler.clone(),
        )?);
        let node_server = NodeServer::new(uuid, queue.clone(), jobs.clone(), reference.clone())?;
        let client_server = ClientServer::new(jobs.clone())?;

        let server_tls = match &tls {
            Some(tls) => Some(tls::server_config(tls)?),
            None => None,
        };
        let multiplexer = |name: &str, listen: &[SocketAddr], tls_listen: &[SocketAddr]| {
            let mut mux = MultiplexerConfig::new(name);
            mux.listen = listen.to_vec();
            mux.tls_listen = tls_listen.to_vec();
            mux.tls = server_tls.clone();
            mux.select_timeout = config.select_timeout();
            mux.mode = config.mode.into();
            mux
        };

        let client_mux = ConnectionMultiplexer::bind(
            multiplexer("clients", &config.client_listen, &config.client_tls_listen),
            client_server,
        )
        .await?;
        let node_mux = ConnectionMultiplexer::bind(
            multiplexer("nodes", &config.node_listen, &config.node_tls_listen),
            node_server.clone(),
        )
        .await?;

        let driver = Self {
            uuid,
            queue,
            jobs,
            reference,
            node_server,
            clients: client_mux.handle(),
            nodes: node_mux.handle(),
            client_addrs: client_mux.local_addrs().to_vec(),
            client_tls_addrs: client_mux.tls_addrs().to_vec(),
            node_addrs: node_mux.local_addrs().to_vec(),
            node_tls_addrs: node_mux.tls_addrs().to_vec(),
            tasks: vec![spawn_mux(client_mux), spawn_mux(node_mux)],
        };
        info!(
            driver = %uuid,
            clients = ?driver.client_addrs,
            clients_tls = ?driver.client_tls_addrs,
            nodes = ?driver.node_addrs,
            nodes_tls = ?driver.node_tls_addrs,
            bundler = %config.bundler.algorithm,
            "driver started"
        );
        Ok(driver)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn client_addrs(&self) -> &[SocketAddr] {
        &self.client_addrs
    }

    pub fn client_tls_addrs(&self) -> &[SocketAddr] {
        &self.client_tls_addrs
    }

    pub fn node_addrs(&self) -> &[SocketAddr] {
        &self.node_addrs
    }

    pub fn node_tls_addrs(&self) -> &[SocketAddr] {
        &self.node_tls_addrs
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Cancels a job on behalf of an administrator.
    pub fn cancel_job(&self, job_id: Uuid) -> Result<usize> {
        self.jobs.cancel_job(job_id)
    }

    /// Suspends or resumes dispatch of a job's queued tasks.
    pub fn suspend_job(&self, job_id: Uuid, suspended: bool) -> usize {
        self.queue.set_suspended(job_id, suspended)
    }

    /// Replaces the driver-wide bundler settings. Returns the new version.
    pub fn update_bundler(&self, settings: BundlerSettings) -> Result<u64> {
        let version = self.reference.update(settings)?;
        info!(version, "bundler settings updated");
        Ok(version)
    }

    /// Pins one node channel to its own bundler, or releases it with `None`.
    pub fn pin_bundler(&self, channel: ChannelId, settings: Option<BundlerSettings>) -> Result<bool> {
        if let Some(settings) = &settings {
            self.reference.registry().create(settings)?;
        }
        Ok(self.node_server.pin_bundler(channel, settings))
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.node_server.nodes()
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs.jobs()
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            queue: self.queue.stats(),
            clients: self.clients.metrics(),
            nodes: self.nodes.metrics(),
            active_jobs: self.jobs.len(),
            idle_nodes: self.node_server.idle_count(),
            bundler_version: self.reference.version(),
        }
    }

    /// Stops both multiplexers and waits for their channels to close.
    pub async fn shutdown(self) {
        self.clients.shutdown();
        self.nodes.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        info!(driver = %self.uuid, "driver stopped");
    }
}

fn spawn_mux<S: jobgrid_transport::ChannelServer>(mux: ConnectionMultiplexer<S>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = mux.run().await {
            error!(error = %e, "multiplexer failed");
        }
    })
}
