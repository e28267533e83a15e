//! Submitting jobs to a driver and collecting their results.
//!
//! One connection carries any number of jobs. A reader task routes every incoming
//! batch to the handle of the job it belongs to.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use jobgrid_transport::{
    FrameReader, FrameWriter, FramedConnection, Handshake, JobResults, PeerRole, TaskResult,
    TlsConnector, WireMessage, PROTOCOL_VERSION,
};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::job::Job;

#[derive(Debug)]
enum JobEvent {
    Results(JobResults),
    Cancelled,
    Disconnected,
}

type Routes = DashMap<Uuid, mpsc::UnboundedSender<JobEvent>>;

/// Results of a finished job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    /// Sorted by task position.
    pub results: Vec<TaskResult>,
    /// Number of results in each batch, in arrival order.
    pub batch_sizes: Vec<usize>,
}

/// A submitted job whose results have not all arrived.
pub struct JobHandle {
    job_id: Uuid,
    total: usize,
    events: mpsc::UnboundedReceiver<JobEvent>,
    writer: Arc<Mutex<FrameWriter>>,
    results: Vec<TaskResult>,
    batch_sizes: Vec<usize>,
    done: bool,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn task_count(&self) -> usize {
        self.total
    }

    /// Waits for the next batch. Returns `Ok(None)` once the job is complete.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<TaskResult>>> {
        if self.done {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(JobEvent::Results(batch)) => {
                self.done = batch.pending == 0;
                self.batch_sizes.push(batch.results.len());
                self.results.extend(batch.results.iter().cloned());
                Ok(Some(batch.results))
            }
            Some(JobEvent::Cancelled) => {
                self.done = true;
                Err(ClientError::JobCancelled(self.job_id))
            }
            Some(JobEvent::Disconnected) | None => {
                self.done = true;
                Err(ClientError::Disconnected)
            }
        }
    }

    /// Waits until every task has a result.
    pub async fn results(mut self) -> Result<JobOutcome> {
        while self.next_batch().await?.is_some() {}
        let mut results = std::mem::take(&mut self.results);
        results.sort_by_key(|r| r.position);
        Ok(JobOutcome {
            job_id: self.job_id,
            results,
            batch_sizes: std::mem::take(&mut self.batch_sizes),
        })
    }

    /// Asks the driver to cancel the job. The handle then resolves with
    /// [`ClientError::JobCancelled`].
    pub async fn cancel(&self) -> Result<()> {
        send(&self.writer, &WireMessage::CancelJob { job_id: self.job_id }).await
    }
}

/// Connection to a driver's client listener.
pub struct JobClient {
    uuid: Uuid,
    peer: SocketAddr,
    writer: Arc<Mutex<FrameWriter>>,
    routes: Arc<Routes>,
    reader: JoinHandle<()>,
}

impl JobClient {
    /// Connects and announces this process as a client. Pass a connector and server
    /// name for a TLS listener.
    pub async fn connect(addr: SocketAddr, tls: Option<(&TlsConnector, &str)>) -> Result<Self> {
        let mut connection = FramedConnection::connect(addr, tls).await?;
        let uuid = Uuid::new_v4();
        connection
            .send(&WireMessage::Handshake(Handshake {
                role: PeerRole::Client,
                protocol_version: PROTOCOL_VERSION,
                uuid,
                processing_threads: None,
            }))
            .await?;
        let peer = connection.peer_addr();
        let (reader, writer) = connection.into_split();
        let routes: Arc<Routes> = Arc::new(DashMap::new());
        let reader = tokio::spawn(route_loop(reader, routes.clone()));
        info!(driver = %peer, client = %uuid, "connected to driver");
        Ok(Self {
            uuid,
            peer,
            writer: Arc::new(Mutex::new(writer)),
            routes,
            reader,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Jobs submitted on this connection that have not finished.
    pub fn pending_jobs(&self) -> usize {
        self.routes.len()
    }

    pub async fn submit(&self, job: Job) -> Result<JobHandle> {
        let job_id = job.id();
        let total = job.task_count();
        let (tx, events) = mpsc::unbounded_channel();
        // register before sending so that no early batch is missed
        if self.routes.insert(job_id, tx).is_some() {
            return Err(ClientError::DuplicateJob(job_id));
        }
        if let Err(e) = send(&self.writer, &WireMessage::JobSubmission(job.into_submission())).await {
            self.routes.remove(&job_id);
            return Err(e);
        }
        debug!(%job_id, tasks = total, "job submitted");
        Ok(JobHandle {
            job_id,
            total,
            events,
            writer: self.writer.clone(),
            results: Vec::with_capacity(total),
            batch_sizes: Vec::new(),
            done: false,
        })
    }

    /// Submits a job and waits for all of its results.
    pub async fn execute(&self, job: Job) -> Result<JobOutcome> {
        self.submit(job).await?.results().await
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        send(&self.writer, &WireMessage::CancelJob { job_id }).await
    }

    /// Closes the connection. The driver cancels any job still pending.
    pub async fn close(self) -> Result<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl Drop for JobClient {
    fn drop(&mut self) {
        self.reader.abort();
        for entry in self.routes.iter() {
            let _ = entry.value().send(JobEvent::Disconnected);
        }
    }
}

async fn send(writer: &Mutex<FrameWriter>, message: &WireMessage) -> Result<()> {
    writer.lock().await.send(message).await?;
    Ok(())
}

async fn route_loop(mut reader: FrameReader, routes: Arc<Routes>) {
    loop {
        match reader.recv().await {
            Ok(Some(WireMessage::JobResults(batch))) => {
                let job_id = batch.job_id;
                let finished = batch.pending == 0;
                match routes.get(&job_id) {
                    Some(route) => {
                        let _ = route.send(JobEvent::Results(batch));
                    }
                    None => debug!(%job_id, "results for unknown job"),
                }
                if finished {
                    routes.remove(&job_id);
                }
            }
            Ok(Some(WireMessage::JobCancelled { job_id })) => {
                if let Some((_, route)) = routes.remove(&job_id) {
                    let _ = route.send(JobEvent::Cancelled);
                }
            }
            Ok(Some(other)) => {
                warn!(kind = other.kind(), "unexpected message from driver");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "driver connection failed");
                break;
            }
        }
    }
    let orphaned: Vec<Uuid> = routes.iter().map(|e| *e.key()).collect();
    for job_id in orphaned {
        if let Some((_, route)) = routes.remove(&job_id) {
            let _ = route.send(JobEvent::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgrid_transport::{ConnectionStream, TaskOutcome};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn fake_driver() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn accept(listener: &TcpListener) -> FramedConnection {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut conn = FramedConnection::from_stream(ConnectionStream::Plain(stream), peer);
        match conn.expect().await.unwrap() {
            WireMessage::Handshake(h) => {
                assert_eq!(h.role, PeerRole::Client);
                assert_eq!(h.processing_threads, None);
            }
            other => panic!("expected handshake, got {:?}", other),
        }
        conn
    }

    async fn expect_submission(conn: &mut FramedConnection) -> jobgrid_transport::JobSubmission {
        match conn.expect().await.unwrap() {
            WireMessage::JobSubmission(s) => s,
            other => panic!("expected submission, got {:?}", other),
        }
    }

    fn result(position: u32) -> TaskResult {
        TaskResult {
            position,
            outcome: TaskOutcome::Completed(position.to_string().into_bytes()),
            elapsed_nanos: 1,
            cpu_nanos: 0,
        }
    }

    #[tokio::test]
    async fn test_results_collected_in_position_order() {
        let (listener, addr) = fake_driver().await;
        let driver = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            let submission = expect_submission(&mut conn).await;
            let job_id = submission.header.job_id;
            assert_eq!(submission.tasks.len(), 3);
            for (results, pending) in [(vec![result(2)], 2), (vec![result(1), result(0)], 0)] {
                conn.send(&WireMessage::JobResults(JobResults {
                    job_id,
                    results,
                    pending,
                }))
                .await
                .unwrap();
            }
            conn
        });

        let client = JobClient::connect(addr, None).await.unwrap();
        let job = Job::new("ordered").task("echo", "0").task("echo", "1").task("echo", "2");
        let outcome = client.execute(job).await.unwrap();
        let positions: Vec<u32> = outcome.results.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(outcome.batch_sizes, vec![1, 2]);
        assert_eq!(client.pending_jobs(), 0);
        let _conn = driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_jobs_routed_independently() {
        let (listener, addr) = fake_driver().await;
        let driver = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            let first = expect_submission(&mut conn).await.header.job_id;
            let second = expect_submission(&mut conn).await.header.job_id;
            for job_id in [second, first] {
                conn.send(&WireMessage::JobResults(JobResults {
                    job_id,
                    results: vec![result(0)],
                    pending: 0,
                }))
                .await
                .unwrap();
            }
            conn
        });

        let client = JobClient::connect(addr, None).await.unwrap();
        let a = client.submit(Job::new("a").task("echo", "")).await.unwrap();
        let b = client.submit(Job::new("b").task("echo", "")).await.unwrap();
        let (a_id, b_id) = (a.job_id(), b.job_id());
        let (a, b) = tokio::join!(a.results(), b.results());
        assert_eq!(a.unwrap().job_id, a_id);
        assert_eq!(b.unwrap().job_id, b_id);
        let _conn = driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_resolves_handle() {
        let (listener, addr) = fake_driver().await;
        let driver = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            let job_id = expect_submission(&mut conn).await.header.job_id;
            assert_eq!(conn.expect().await.unwrap(), WireMessage::CancelJob { job_id });
            conn.send(&WireMessage::JobCancelled { job_id }).await.unwrap();
            conn
        });

        let client = JobClient::connect(addr, None).await.unwrap();
        let handle = client.submit(Job::new("doomed").task("sleep", "10000")).await.unwrap();
        handle.cancel().await.unwrap();
        let job_id = handle.job_id();
        assert!(matches!(
            handle.results().await,
            Err(ClientError::JobCancelled(id)) if id == job_id
        ));
        let _conn = driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_loss_fails_pending_jobs() {
        let (listener, addr) = fake_driver().await;
        let driver = tokio::spawn(async move {
            let mut conn = accept(&listener).await;
            expect_submission(&mut conn).await;
            drop(conn);
        });

        let client = JobClient::connect(addr, None).await.unwrap();
        let handle = client.submit(Job::new("orphan").task("echo", "")).await.unwrap();
        driver.await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.results())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = fake_driver().await;
        drop(listener);
        assert!(matches!(
            JobClient::connect(addr, None).await,
            Err(ClientError::Transport(_))
        ));
    }
}
