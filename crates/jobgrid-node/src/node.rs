//! The node process: connects to a driver, executes the bundles it receives and sends
//! the results back, reconnecting with backoff whenever the connection is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use jobgrid_transport::{
    BundleDispatch, FrameReader, FrameWriter, FramedConnection, Handshake, PeerRole,
    RetryExecutor, RetryOutcome, TlsConfig, TlsConnector, TransportError, WireMessage,
    PROTOCOL_VERSION,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{ExecutionError, NodeError, Result};
use crate::execution::NodeExecutionManager;
use crate::resource::{DirectoryResources, NoResources, ResourceProvider};
use crate::task::TaskRegistry;
use crate::thread_manager::ThreadManagerRegistry;

/// Why a driver session ended without an error.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Reconnect(String),
}

type Inbound = std::result::Result<WireMessage, TransportError>;

/// Management side of a running node.
#[derive(Clone)]
pub struct NodeHandle {
    manager: Arc<NodeExecutionManager>,
    shutdown: CancellationToken,
    reconnect: Arc<Notify>,
    sessions: Arc<AtomicU64>,
}

impl NodeHandle {
    pub fn manager(&self) -> &Arc<NodeExecutionManager> {
        &self.manager
    }

    /// Stops the node after cancelling whatever is running.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drops the current driver connection and dials again. A running round is cancelled.
    pub fn request_reconnection(&self, reason: impl Into<String>) {
        self.manager.set_reconnection_notification(reason);
        self.reconnect.notify_one();
    }

    /// Cancels the running round. With `requeue` the driver puts the tasks back on its queue.
    pub fn cancel_current_round(&self, requeue: bool) -> usize {
        self.manager.cancel_all_tasks(true, requeue)
    }

    /// Driver sessions established so far.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::SeqCst)
    }
}

pub struct Node {
    config: NodeConfig,
    uuid: Uuid,
    tls: Option<(TlsConnector, String)>,
    handle: NodeHandle,
}

impl Node {
    /// Builds a node from its configuration, loading TLS material from disk.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(files) => Some(files.load()?),
            None => None,
        };
        let resources: Arc<dyn ResourceProvider> = match &config.resource_dir {
            Some(dir) => Arc::new(DirectoryResources::new(dir)),
            None => Arc::new(NoResources),
        };
        Self::with_parts(
            config,
            ThreadManagerRegistry::default(),
            TaskRegistry::default(),
            resources,
            tls,
        )
    }

    /// Like [`Node::new`] with explicit registries, resources and in-memory TLS material.
    pub fn with_parts(
        config: NodeConfig,
        thread_managers: ThreadManagerRegistry,
        tasks: TaskRegistry,
        resources: Arc<dyn ResourceProvider>,
        tls: Option<TlsConfig>,
    ) -> Result<Self> {
        let threads =
            thread_managers.create(&config.thread_manager, config.threads, config.priority)?;
        let manager = Arc::new(NodeExecutionManager::new(threads, tasks, resources)?);
        let tls = match tls {
            Some(tls) => {
                let server_name = config
                    .tls
                    .as_ref()
                    .map(|t| t.server_name.clone())
                    .unwrap_or_else(|| "localhost".to_string());
                Some((TlsConnector::new(&tls)?, server_name))
            }
            None => None,
        };
        Ok(Self {
            uuid: config.uuid.unwrap_or_else(Uuid::new_v4),
            config,
            tls,
            handle: NodeHandle {
                manager,
                shutdown: CancellationToken::new(),
                reconnect: Arc::new(Notify::new()),
                sessions: Arc::new(AtomicU64::new(0)),
            },
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    /// Starts [`Node::run`] on the runtime.
    pub fn spawn(self) -> (NodeHandle, JoinHandle<Result<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Serves drivers until shut down. Returns an error only when connecting fails
    /// permanently or the retries run out.
    pub async fn run(self) -> Result<()> {
        let retry = RetryExecutor::new(self.config.retry.clone());
        info!(node = %self.uuid, driver = %self.config.driver, threads = self.config.threads, "node starting");
        let result = loop {
            let outcome = tokio::select! {
                _ = self.handle.shutdown.cancelled() => break Ok(()),
                outcome = retry.execute(|| self.connect()) => outcome,
            };
            let connection = match outcome {
                RetryOutcome::Success(connection) => connection,
                RetryOutcome::Exhausted {
                    last_error,
                    attempts,
                } => {
                    error!(driver = %self.config.driver, attempts, error = %last_error, "giving up on driver");
                    break Err(last_error.into());
                }
            };
            match self.session(connection).await {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Reconnect(reason)) => {
                    info!(%reason, "reconnecting to driver");
                }
                Err(e) => {
                    warn!(driver = %self.config.driver, error = %e, "driver session ended");
                }
            }
        };
        self.handle.manager.shutdown();
        info!(node = %self.uuid, "node stopped");
        result
    }

    async fn connect(&self) -> jobgrid_transport::Result<FramedConnection> {
        let tls = self
            .tls
            .as_ref()
            .map(|(connector, name)| (connector, name.as_str()));
        FramedConnection::connect(self.config.driver, tls).await
    }

    async fn session(&self, connection: FramedConnection) -> Result<SessionEnd> {
        let peer = connection.peer_addr();
        let (reader, mut writer) = connection.into_split();
        let manager = &self.handle.manager;

        // the handshake advertises the current pool size
        manager.take_config_changed();
        writer
            .send(&WireMessage::Handshake(Handshake {
                role: PeerRole::Node,
                protocol_version: PROTOCOL_VERSION,
                uuid: self.uuid,
                processing_threads: Some(manager.thread_pool_size() as u32),
            }))
            .await?;
        self.handle.sessions.fetch_add(1, Ordering::SeqCst);
        info!(driver = %peer, node = %self.uuid, "connected to driver");

        let (tx, mut rx) = mpsc::channel(16);
        let reader_task = tokio::spawn(read_loop(reader, tx));
        let result = self.serve(&mut writer, &mut rx).await;
        reader_task.abort();
        let _ = writer.shutdown().await;
        result
    }

    async fn serve(
        &self,
        writer: &mut FrameWriter,
        rx: &mut mpsc::Receiver<Inbound>,
    ) -> Result<SessionEnd> {
        let manager = &self.handle.manager;
        loop {
            tokio::select! {
                _ = self.handle.shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
                _ = self.handle.reconnect.notified() => {
                    if let Some(reason) = manager.take_reconnection_notification() {
                        return Ok(SessionEnd::Reconnect(reason));
                    }
                }
                message = rx.recv() => match next_message(message)? {
                    WireMessage::Bundle(bundle) => {
                        if let Some(end) = self.run_round(bundle, writer, rx).await? {
                            return Ok(end);
                        }
                    }
                    WireMessage::CancelJob { job_id } => {
                        debug!(%job_id, "cancel for a job that is not executing");
                    }
                    other => {
                        return Err(NodeError::Protocol(format!(
                            "unexpected {} while idle",
                            other.kind()
                        )));
                    }
                },
            }
        }
    }

    /// Executes one bundle and reports its results. Returns `Some` when the session
    /// must end.
    async fn run_round(
        &self,
        bundle: BundleDispatch,
        writer: &mut FrameWriter,
        rx: &mut mpsc::Receiver<Inbound>,
    ) -> Result<Option<SessionEnd>> {
        let manager = self.handle.manager.clone();
        let (bundle_id, job_id) = (bundle.bundle_id, bundle.job_id);
        debug!(bundle_id, %job_id, tasks = bundle.tasks.len(), "bundle received");

        let mut round = {
            let manager = manager.clone();
            tokio::task::spawn_blocking(move || manager.execute(&bundle))
        };
        let outcome = loop {
            tokio::select! {
                joined = &mut round => break joined?,
                _ = self.handle.shutdown.cancelled() => {
                    self.abort_round(round).await;
                    return Ok(Some(SessionEnd::Shutdown));
                }
                message = rx.recv() => match next_message(message) {
                    Ok(WireMessage::CancelJob { job_id: cancelled }) if cancelled == job_id => {
                        let count = manager.cancel_all_tasks(true, false);
                        info!(bundle_id, %job_id, tasks = count, "job cancelled by driver");
                    }
                    Ok(WireMessage::CancelJob { job_id: other }) => {
                        debug!(%other, "cancel for a job that is not executing");
                    }
                    Ok(other) => {
                        self.abort_round(round).await;
                        return Err(NodeError::Protocol(format!(
                            "unexpected {} during bundle {}",
                            other.kind(),
                            bundle_id
                        )));
                    }
                    Err(e) => {
                        self.abort_round(round).await;
                        return Err(e);
                    }
                },
            }
        };

        match outcome {
            Ok(report) => {
                let results = manager.bundle_results(report);
                manager.cleanup();
                writer.send(&WireMessage::BundleResults(results)).await?;
                Ok(None)
            }
            Err(ExecutionError::Reconnection(reason)) => {
                manager.cancel_all_tasks(true, false);
                manager.cleanup();
                Ok(Some(SessionEnd::Reconnect(reason)))
            }
            Err(e) => {
                manager.cleanup();
                Err(e.into())
            }
        }
    }

    async fn abort_round(
        &self,
        round: JoinHandle<std::result::Result<crate::execution::RoundReport, ExecutionError>>,
    ) {
        let manager = &self.handle.manager;
        manager.cancel_all_tasks(true, false);
        let _ = round.await;
        manager.cleanup();
    }
}

fn next_message(message: Option<Inbound>) -> Result<WireMessage> {
    match message {
        Some(Ok(message)) => Ok(message),
        Some(Err(e)) => Err(e.into()),
        None => Err(TransportError::ConnectionClosed.into()),
    }
}

async fn read_loop(mut reader: FrameReader, tx: mpsc::Sender<Inbound>) {
    loop {
        let inbound = match reader.recv().await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(e) => Err(e),
        };
        let last = inbound.is_err();
        if tx.send(inbound).await.is_err() || last {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_transport::{ConnectionStream, RetryConfig, TaskOutcome, TaskSpec};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn fake_driver() -> (TcpListener, NodeConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = NodeConfig {
            driver: listener.local_addr().unwrap(),
            threads: 2,
            retry: RetryConfig {
                max_retries: None,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                backoff_multiplier: 2.0,
                jitter: false,
            },
            ..NodeConfig::default()
        };
        (listener, config)
    }

    async fn accept(listener: &TcpListener) -> (FramedConnection, Handshake) {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut conn = FramedConnection::from_stream(ConnectionStream::Plain(stream), peer);
        match conn.expect().await.unwrap() {
            WireMessage::Handshake(handshake) => (conn, handshake),
            other => panic!("expected handshake, got {:?}", other),
        }
    }

    fn bundle(bundle_id: u64, tasks: Vec<(&str, &[u8])>) -> BundleDispatch {
        BundleDispatch {
            bundle_id,
            job_id: Uuid::new_v4(),
            uuid_path: Vec::new(),
            tasks: tasks
                .into_iter()
                .enumerate()
                .map(|(i, (kind, payload))| TaskSpec {
                    position: i as u32,
                    kind: kind.into(),
                    payload: payload.to_vec(),
                    timeout: None,
                })
                .collect(),
        }
    }

    async fn expect_results(conn: &mut FramedConnection) -> jobgrid_transport::BundleResults {
        match tokio::time::timeout(Duration::from_secs(5), conn.expect())
            .await
            .unwrap()
            .unwrap()
        {
            WireMessage::BundleResults(results) => results,
            other => panic!("expected results, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executes_bundles() {
        let (listener, config) = fake_driver().await;
        let node = Node::new(config).unwrap();
        let uuid = node.uuid();
        let (handle, task) = node.spawn();

        let (mut conn, handshake) = accept(&listener).await;
        assert_eq!(handshake.role, PeerRole::Node);
        assert_eq!(handshake.uuid, uuid);
        assert_eq!(handshake.processing_threads, Some(2));

        for bundle_id in 1..=2 {
            let b = bundle(bundle_id, vec![("echo", b"a"), ("fail", b"x"), ("echo", b"c")]);
            conn.send(&WireMessage::Bundle(b.clone())).await.unwrap();
            let results = expect_results(&mut conn).await;
            assert_eq!(results.bundle_id, bundle_id);
            assert_eq!(results.job_id, b.job_id);
            assert_eq!(results.results.len(), 3);
            assert!(!results.requeue);
            assert_eq!(results.processing_threads, None);
        }

        handle.manager().set_thread_pool_size(4).unwrap();
        conn.send(&WireMessage::Bundle(bundle(3, vec![("echo", b"")])))
            .await
            .unwrap();
        assert_eq!(expect_results(&mut conn).await.processing_threads, Some(4));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_from_driver() {
        let (listener, config) = fake_driver().await;
        let (handle, task) = Node::new(config).unwrap().spawn();
        let (mut conn, _) = accept(&listener).await;

        let b = bundle(7, vec![("sleep", b"10000"), ("sleep", b"10000")]);
        let job_id = b.job_id;
        conn.send(&WireMessage::Bundle(b)).await.unwrap();
        while handle.manager().future_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        conn.send(&WireMessage::CancelJob { job_id }).await.unwrap();
        let results = expect_results(&mut conn).await;
        assert!(results
            .results
            .iter()
            .all(|r| r.outcome == TaskOutcome::Cancelled));

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_requeue_from_management() {
        let (listener, config) = fake_driver().await;
        let (handle, task) = Node::new(config).unwrap().spawn();
        let (mut conn, _) = accept(&listener).await;

        conn.send(&WireMessage::Bundle(bundle(8, vec![("sleep", b"10000")])))
            .await
            .unwrap();
        while handle.manager().future_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handle.cancel_current_round(true), 1);
        let results = expect_results(&mut conn).await;
        assert!(results.requeue);
        assert_eq!(results.results[0].outcome, TaskOutcome::Cancelled);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_driver_loss_and_on_request() {
        let (listener, config) = fake_driver().await;
        let (handle, task) = Node::new(config).unwrap().spawn();

        let (conn, _) = accept(&listener).await;
        drop(conn);
        let (mut conn, _) = accept(&listener).await;

        // a reconnection request in the middle of a round cancels it
        conn.send(&WireMessage::Bundle(bundle(9, vec![("sleep", b"10000")])))
            .await
            .unwrap();
        while handle.manager().future_count() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.request_reconnection("pool resized");
        assert!(conn.recv().await.unwrap_or(None).is_none());
        let (_conn, handshake) = accept(&listener).await;
        assert_eq!(handshake.role, PeerRole::Node);
        assert!(!handle.manager().is_executing());
        assert!(handle.sessions() >= 2);

        handle.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_when_retries_exhausted() {
        let (listener, mut config) = fake_driver().await;
        drop(listener);
        config.retry.max_retries = Some(1);
        let result = Node::new(config).unwrap().run().await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_unexpected_message_ends_session() {
        let (listener, config) = fake_driver().await;
        let (handle, task) = Node::new(config).unwrap().spawn();
        let (mut conn, _) = accept(&listener).await;
        conn.send(&WireMessage::JobCancelled {
            job_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
        assert!(conn.recv().await.unwrap_or(None).is_none());
        // and comes back
        let _ = accept(&listener).await;
        handle.shutdown();
        task.await.unwrap().unwrap();
    }
}
