//! Test Harness - a whole grid inside one process

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use jobgrid_client::JobClient;
use jobgrid_driver::{BundlerRegistry, BundlerSettings, Driver, DriverConfig, ModeConfig};
use jobgrid_node::{
    ExecutionListener, MemoryResources, Node, NodeConfig, NodeHandle, TaskEndedEvent,
    TaskRegistry, ThreadManagerRegistry,
};
use jobgrid_transport::{tls, RetryConfig, TlsConfig, TlsConnector};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Installs a test-friendly subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

/// Records every task-ended event of a node.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<TaskEndedEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<TaskEndedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionListener for EventLog {
    fn task_ended(&self, event: &TaskEndedEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

struct GridTls {
    server: TlsConfig,
    peer: TlsConfig,
    connector: TlsConnector,
}

impl GridTls {
    fn generate(mutual: bool) -> anyhow::Result<Self> {
        let (ca_cert, ca_key) = tls::generate_self_signed_ca()?;
        let (server_cert, server_key) = tls::generate_signed_cert(&ca_cert, &ca_key, "localhost")?;
        let (peer_cert, peer_key) = tls::generate_signed_cert(&ca_cert, &ca_key, "grid-peer")?;
        let server = TlsConfig::new(ca_cert.clone(), server_cert, server_key, mutual);
        let peer = TlsConfig::new(ca_cert, peer_cert, peer_key, false);
        let connector = TlsConnector::new(&peer)?;
        Ok(Self {
            server,
            peer,
            connector,
        })
    }
}

pub struct GridBuilder {
    bundler: BundlerSettings,
    nodes: usize,
    threads: usize,
    tls: Option<bool>,
    mode: ModeConfig,
}

impl Default for GridBuilder {
    fn default() -> Self {
        Self {
            bundler: BundlerSettings::default(),
            nodes: 1,
            threads: 4,
            tls: None,
            mode: ModeConfig::Parallel { workers: 4 },
        }
    }
}

impl GridBuilder {
    pub fn bundler(mut self, settings: BundlerSettings) -> Self {
        self.bundler = settings;
        self
    }

    pub fn nodes(mut self, count: usize) -> Self {
        self.nodes = count;
        self
    }

    /// Worker threads per node.
    pub fn threads(mut self, count: usize) -> Self {
        self.threads = count;
        self
    }

    /// Serves clients and nodes over TLS only; `mutual` makes the driver demand
    /// peer certificates.
    pub fn tls(mut self, mutual: bool) -> Self {
        self.tls = Some(mutual);
        self
    }

    pub fn mode(mut self, mode: ModeConfig) -> Self {
        self.mode = mode;
        self
    }

    pub async fn start(self) -> anyhow::Result<TestGrid> {
        init_tracing();
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        let tls = self.tls.map(GridTls::generate).transpose()?;
        let (plain, secure) = match tls {
            Some(_) => (Vec::new(), vec![loopback]),
            None => (vec![loopback], Vec::new()),
        };
        let config = DriverConfig {
            client_listen: plain.clone(),
            node_listen: plain,
            client_tls_listen: secure.clone(),
            node_tls_listen: secure,
            select_timeout_ms: 100,
            mode: self.mode,
            bundler: self.bundler,
            ..DriverConfig::default()
        };
        let driver = Driver::start_with(
            config,
            BundlerRegistry::default(),
            tls.as_ref().map(|t| t.server.clone()),
        )
        .await?;

        let mut grid = TestGrid {
            driver: Some(driver),
            nodes: Vec::new(),
            tls,
            threads: self.threads,
        };
        for _ in 0..self.nodes {
            grid.add_node().await?;
        }
        grid.wait_for_nodes(self.nodes).await?;
        Ok(grid)
    }
}

pub struct GridNode {
    pub uuid: Uuid,
    pub handle: NodeHandle,
    pub events: Arc<EventLog>,
    pub resources: Arc<MemoryResources>,
    task: JoinHandle<jobgrid_node::Result<()>>,
}

pub struct TestGrid {
    driver: Option<Driver>,
    nodes: Vec<GridNode>,
    tls: Option<GridTls>,
    threads: usize,
}

impl TestGrid {
    pub fn builder() -> GridBuilder {
        GridBuilder::default()
    }

    pub fn driver(&self) -> &Driver {
        // only `shutdown` takes the driver out, and it consumes the grid
        self.driver.as_ref().unwrap()
    }

    pub fn node(&self, index: usize) -> &GridNode {
        &self.nodes[index]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node_addr(&self) -> SocketAddr {
        let driver = self.driver();
        match self.tls {
            Some(_) => driver.node_tls_addrs()[0],
            None => driver.node_addrs()[0],
        }
    }

    pub async fn client(&self) -> anyhow::Result<JobClient> {
        let driver = self.driver();
        let client = match &self.tls {
            Some(tls) => {
                JobClient::connect(driver.client_tls_addrs()[0], Some((&tls.connector, "localhost")))
                    .await?
            }
            None => JobClient::connect(driver.client_addrs()[0], None).await?,
        };
        Ok(client)
    }

    pub async fn add_node(&mut self) -> anyhow::Result<&GridNode> {
        self.add_node_with(|_| {}).await
    }

    /// Starts another node after letting `configure` adjust its configuration.
    pub async fn add_node_with(
        &mut self,
        configure: impl FnOnce(&mut NodeConfig),
    ) -> anyhow::Result<&GridNode> {
        let mut config = NodeConfig {
            driver: self.node_addr(),
            threads: self.threads,
            retry: RetryConfig {
                max_retries: None,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(200),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..NodeConfig::default()
        };
        configure(&mut config);

        let resources = Arc::new(MemoryResources::new());
        let node = Node::with_parts(
            config,
            ThreadManagerRegistry::default(),
            TaskRegistry::default(),
            resources.clone(),
            self.tls.as_ref().map(|t| t.peer.clone()),
        )?;
        let uuid = node.uuid();
        let events = Arc::new(EventLog::default());
        node.handle().manager().add_listener(events.clone());
        let (handle, task) = node.spawn();
        self.nodes.push(GridNode {
            uuid,
            handle,
            events,
            resources,
            task,
        });
        Ok(&self.nodes[self.nodes.len() - 1])
    }

    /// Shuts a node down; the driver sees its connection drop.
    pub async fn stop_node(&mut self, index: usize) -> anyhow::Result<()> {
        let node = self.nodes.remove(index);
        node.handle.shutdown();
        node.task.await??;
        Ok(())
    }

    /// Waits until the driver has completed the handshake of `count` nodes.
    pub async fn wait_for_nodes(&self, count: usize) -> anyhow::Result<()> {
        let driver = self.driver();
        wait_until(Duration::from_secs(5), || driver.nodes().len() == count)
            .await
            .with_context(|| format!("driver never saw {} nodes", count))
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        for node in self.nodes.drain(..) {
            node.handle.shutdown();
            node.task.await??;
        }
        if let Some(driver) = self.driver.take() {
            driver.shutdown().await;
        }
        Ok(())
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
