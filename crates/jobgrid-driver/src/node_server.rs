//! Node-facing channel server.
//!
//! ```text
//! AwaitingHandshake --handshake--> Idle --bundle--> SendingBundle --sent--> WaitingForResults
//!                                   ^  \--cycle/empty--> Idle                 |    ^
//!                                   |                                         v    |
//!                                   +---------------results------------ CancellingJob
//! ```
//!
//! Any state moves to `Closed` when the node disconnects. A slice that was handed to
//! the node and not answered goes back on the queue when the channel closes.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use jobgrid_transport::{
    BundleResults, Channel, ChannelId, ChannelServer, Handshake, Interest, MultiplexerHandle,
    PeerRole, Readiness, Received, StateHandler, StateMachine, StateMachineBuilder, TaskOutcome,
    TransportError, WireMessage, PROTOCOL_VERSION,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::TaskBundle;
use crate::bundler::{BundlerReference, BundlerSettings, ChannelBundler, NodeProfile};
use crate::dispatch::{select_bundle, Dispatch};
use crate::job::{CancelHook, JobRegistry};
use crate::queue::{JobQueue, QueueEvent, QueueListener};

type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    AwaitingHandshake,
    Idle,
    SendingBundle,
    WaitingForResults,
    CancellingJob,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeTransition {
    ToIdle,
    ToSendingBundle,
    ToWaitingForResults,
    ToCancellingJob,
    ToClosed,
    Stay,
}

use NodeTransition::*;

struct InFlight {
    bundle: TaskBundle,
    sent_at: Option<Instant>,
}

pub struct NodeContext {
    id: ChannelId,
    peer: SocketAddr,
    secure: bool,
    uuid: Option<Uuid>,
    bundler: Option<ChannelBundler>,
    in_flight: Option<InFlight>,
}

impl NodeContext {
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid
    }

    fn bundler(&mut self) -> Result<&mut ChannelBundler> {
        self.bundler.as_mut().ok_or_else(|| TransportError::ProtocolViolation {
            reason: "bundler used before handshake".into(),
        })
    }
}

/// Per-node view for administration.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub channel: ChannelId,
    pub peer: SocketAddr,
    pub secure: bool,
    pub uuid: Uuid,
    pub processing_threads: u32,
    pub bundler: String,
    pub bundler_pinned: bool,
    /// Job of the slice the node is executing.
    pub executing: Option<Uuid>,
    pub rounds: u64,
}

/// Idle node channels, woken one at a time as bundles arrive.
#[derive(Default)]
struct IdleChannels {
    channels: Mutex<HashMap<ChannelId, Uuid>>,
    handle: OnceLock<MultiplexerHandle>,
}

impl IdleChannels {
    fn insert(&self, id: ChannelId, uuid: Uuid) {
        self.channels.lock().unwrap().insert(id, uuid);
    }

    fn remove(&self, id: ChannelId) {
        self.channels.lock().unwrap().remove(&id);
    }

    fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Wakes one idle channel whose node is not on `uuid_path`.
    fn wake_one(&self, uuid_path: &[Uuid]) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        let picked = {
            let mut channels = self.channels.lock().unwrap();
            let picked = channels
                .iter()
                .find(|(_, uuid)| !uuid_path.contains(uuid))
                .map(|(id, _)| *id);
            if let Some(id) = picked {
                channels.remove(&id);
            }
            picked
        };
        if let Some(id) = picked {
            handle.wake(id, Readiness::WRITABLE);
        }
    }
}

impl QueueListener for IdleChannels {
    fn bundle_added(&self, event: &QueueEvent) {
        self.wake_one(&event.uuid_path);
    }
}

struct Shared {
    driver_uuid: Uuid,
    queue: Arc<JobQueue>,
    jobs: Arc<JobRegistry>,
    reference: Arc<BundlerReference>,
    idle: Arc<IdleChannels>,
    nodes: DashMap<ChannelId, NodeInfo>,
    /// Pending pin (`Some`) or unpin (`None`) requests per channel.
    overrides: DashMap<ChannelId, Option<BundlerSettings>>,
    /// Jobs whose in-flight slice must be cancelled on the node.
    cancels: DashMap<ChannelId, Uuid>,
}

impl Shared {
    fn handle(&self) -> Option<&MultiplexerHandle> {
        self.idle.handle.get()
    }

    fn wake(&self, id: ChannelId) {
        if let Some(handle) = self.handle() {
            handle.wake(id, Readiness::WRITABLE);
        }
    }

    /// Puts a slice back on the queue unless its job is gone.
    fn return_slice(&self, bundle: TaskBundle) {
        if self.jobs.is_active(bundle.job_id()) && !bundle.is_empty() {
            self.queue.requeue(bundle);
        }
    }
}

fn bundle_positions(bundle: &TaskBundle) -> impl Iterator<Item = u32> + '_ {
    bundle.tasks.iter().map(|t| t.position)
}

fn violation(reason: impl Into<String>) -> TransportError {
    TransportError::ProtocolViolation {
        reason: reason.into(),
    }
}

struct AwaitingHandshakeHandler(Arc<Shared>);

#[async_trait]
impl StateHandler<NodeTransition, NodeContext> for AwaitingHandshakeHandler {
    async fn perform(&self, channel: &mut Channel<NodeContext>) -> Result<NodeTransition> {
        let handshake = match channel.receive().await? {
            Received::Message(WireMessage::Handshake(handshake)) => handshake,
            Received::Message(other) => {
                return Err(violation(format!("expected handshake, got {}", other.kind())))
            }
            Received::Pending => return Ok(Stay),
            Received::Closed => return Ok(ToClosed),
        };
        let Handshake {
            role,
            protocol_version,
            uuid,
            processing_threads,
        } = handshake;
        if protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: protocol_version,
            });
        }
        if !matches!(role, PeerRole::Node | PeerRole::PeerDriver) {
            return Err(violation(format!("{:?} connected to the node server", role)));
        }

        let profile = NodeProfile {
            processing_threads: processing_threads.unwrap_or(1).max(1),
        };
        let bundler = self
            .0
            .reference
            .new_channel_bundler(profile)
            .map_err(|e| violation(e.to_string()))?;

        let id = channel.id();
        let context = channel.context_mut();
        context.uuid = Some(uuid);
        self.0.nodes.insert(
            id,
            NodeInfo {
                channel: id,
                peer: context.peer,
                secure: context.secure,
                uuid,
                processing_threads: profile.processing_threads,
                bundler: bundler.name().to_string(),
                bundler_pinned: false,
                executing: None,
                rounds: 0,
            },
        );
        context.bundler = Some(bundler);
        info!(channel = id, node = %uuid, ?role, threads = profile.processing_threads, "node connected");
        self.0.wake(id);
        Ok(ToIdle)
    }

    fn transitions(&self) -> &'static [NodeTransition] {
        &[Stay, ToIdle, ToClosed]
    }
}

struct IdleHandler(Arc<Shared>);

impl IdleHandler {
    fn apply_override(&self, channel: &mut Channel<NodeContext>) -> Result<()> {
        let id = channel.id();
        let Some((_, request)) = self.0.overrides.remove(&id) else {
            return Ok(());
        };
        let bundler = channel.context_mut().bundler()?;
        match request {
            Some(settings) => match self.0.reference.registry().create(&settings) {
                Ok(pinned) => {
                    info!(channel = id, bundler = pinned.name(), "bundler pinned");
                    bundler.pin(pinned);
                }
                Err(e) => warn!(channel = id, error = %e, "ignoring bundler override"),
            },
            None => bundler.unpin(),
        }
        Ok(())
    }
}

#[async_trait]
impl StateHandler<NodeTransition, NodeContext> for IdleHandler {
    async fn perform(&self, channel: &mut Channel<NodeContext>) -> Result<NodeTransition> {
        if channel.is_readable() {
            match channel.receive().await? {
                Received::Closed => return Ok(ToClosed),
                Received::Message(message) => {
                    return Err(violation(format!("idle node sent {}", message.kind())))
                }
                Received::Pending => {}
            }
        }

        let id = channel.id();
        self.0.cancels.remove(&id);
        self.apply_override(channel)?;
        let reference = self.0.reference.clone();
        let context = channel.context_mut();
        let node = context.uuid.ok_or_else(|| violation("idle before handshake"))?;
        let bundler = context.bundler()?;
        bundler.refresh(&reference);
        let size = bundler.next_size();
        let bundler_name = bundler.name().to_string();
        let pinned = bundler.is_overridden();

        // registered first so a bundle queued after our dequeue still wakes us
        self.0.idle.insert(id, node);
        match select_bundle(&self.0.queue, size, node) {
            Dispatch::Send(bundle) => {
                self.0.idle.remove(id);
                if !self.0.queue.is_empty() {
                    // the remainder's wake-up may have picked this channel
                    self.0.idle.wake_one(bundle.uuid_path());
                }
                debug!(
                    channel = id,
                    bundle_id = bundle.id,
                    job_id = %bundle.job_id(),
                    tasks = bundle.task_count(),
                    size,
                    "dispatching bundle"
                );
                if let Some(mut info) = self.0.nodes.get_mut(&id) {
                    info.executing = Some(bundle.job_id());
                    info.bundler = bundler_name;
                    info.bundler_pinned = pinned;
                }
                let message = WireMessage::Bundle(bundle.to_dispatch(self.0.driver_uuid));
                channel.start_send(&message)?;
                channel.context_mut().in_flight = Some(InFlight {
                    bundle,
                    sent_at: None,
                });
                Ok(ToSendingBundle)
            }
            Dispatch::Cycle { .. } | Dispatch::Empty => Ok(ToIdle),
        }
    }

    fn transitions(&self) -> &'static [NodeTransition] {
        &[ToIdle, ToSendingBundle, ToClosed]
    }
}

struct SendingBundleHandler(Arc<Shared>);

#[async_trait]
impl StateHandler<NodeTransition, NodeContext> for SendingBundleHandler {
    async fn perform(&self, channel: &mut Channel<NodeContext>) -> Result<NodeTransition> {
        if channel.is_readable() {
            match channel.receive().await? {
                Received::Pending => {}
                Received::Closed => return Err(violation("node disconnected while receiving a bundle")),
                Received::Message(message) => {
                    return Err(violation(format!("node sent {} during bundle send", message.kind())))
                }
            }
        }
        if !channel.send_pending().await? {
            return Ok(Stay);
        }
        if let Some(in_flight) = channel.context_mut().in_flight.as_mut() {
            in_flight.sent_at = Some(Instant::now());
        }
        // a cancel wake consumed while the bundle was still going out
        let id = channel.id();
        if self.0.cancels.contains_key(&id) {
            self.0.wake(id);
        }
        Ok(ToWaitingForResults)
    }

    fn transitions(&self) -> &'static [NodeTransition] {
        &[Stay, ToWaitingForResults]
    }
}

struct WaitingForResultsHandler(Arc<Shared>);

impl WaitingForResultsHandler {
    /// Refuses results that do not answer the in-flight slice. The slice stays in
    /// flight so that closing the channel requeues it.
    fn check_results(in_flight: Option<&InFlight>, results: &BundleResults) -> Result<()> {
        let in_flight = in_flight.ok_or_else(|| violation("results without a bundle in flight"))?;
        let bundle = &in_flight.bundle;
        if results.bundle_id != bundle.id || results.job_id != bundle.job_id() {
            return Err(violation(format!(
                "results for bundle {} of job {} while bundle {} of job {} is in flight",
                results.bundle_id,
                results.job_id,
                bundle.id,
                bundle.job_id()
            )));
        }
        let mut seen = HashSet::with_capacity(results.results.len());
        for result in &results.results {
            if !bundle_positions(bundle).any(|p| p == result.position) {
                return Err(violation(format!(
                    "result for position {} not in bundle {}",
                    result.position, bundle.id
                )));
            }
            if !seen.insert(result.position) {
                return Err(violation(format!(
                    "duplicate result for position {} in bundle {}",
                    result.position, bundle.id
                )));
            }
        }
        Ok(())
    }

    fn complete_round(&self, channel: &mut Channel<NodeContext>, results: BundleResults) -> Result<()> {
        let id = channel.id();
        let context = channel.context_mut();
        Self::check_results(context.in_flight.as_ref(), &results)?;
        let Some(in_flight) = context.in_flight.take() else {
            return Err(violation("results without a bundle in flight"));
        };

        let elapsed = in_flight
            .sent_at
            .map(|at| at.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let bundler = context.bundler()?;
        if let Some(threads) = results.processing_threads {
            bundler.update_profile(NodeProfile {
                processing_threads: threads.max(1),
            });
        }
        bundler.feedback(in_flight.bundle.task_count(), elapsed);

        if let Some(mut info) = self.0.nodes.get_mut(&id) {
            info.executing = None;
            info.rounds += 1;
            if let Some(threads) = results.processing_threads {
                info.processing_threads = threads.max(1);
            }
        }

        let BundleResults {
            job_id,
            results,
            requeue,
            ..
        } = results;
        debug!(channel = id, %job_id, count = results.len(), elapsed_ns = elapsed, requeue, "round complete");

        // cancelled-for-requeue tasks and tasks the node never answered go back
        let omitted = bundle_positions(&in_flight.bundle)
            .filter(|p| !results.iter().any(|r| r.position == *p))
            .count();
        if omitted > 0 {
            warn!(channel = id, %job_id, bundle_id = in_flight.bundle.id, omitted, "node omitted results");
        }
        let to_deliver: Vec<_> = results
            .into_iter()
            .filter(|r| !(requeue && r.outcome == TaskOutcome::Cancelled))
            .collect();
        let delivered: HashSet<u32> = to_deliver.iter().map(|r| r.position).collect();
        let mut bundle = in_flight.bundle;
        bundle.tasks.retain(|task| !delivered.contains(&task.position));
        self.0.return_slice(bundle);
        self.0.jobs.deliver(job_id, to_deliver);
        Ok(())
    }
}

#[async_trait]
impl StateHandler<NodeTransition, NodeContext> for WaitingForResultsHandler {
    async fn perform(&self, channel: &mut Channel<NodeContext>) -> Result<NodeTransition> {
        match channel.receive().await? {
            Received::Message(WireMessage::BundleResults(results)) => {
                self.complete_round(channel, results)?;
                self.0.wake(channel.id());
                Ok(ToIdle)
            }
            Received::Message(other) => Err(violation(format!(
                "expected bundle results, got {}",
                other.kind()
            ))),
            Received::Closed => Ok(ToClosed),
            Received::Pending => {
                let id = channel.id();
                let Some((_, job_id)) = self.0.cancels.remove(&id) else {
                    return Ok(Stay);
                };
                let executing = channel
                    .context()
                    .in_flight
                    .as_ref()
                    .map(|f| f.bundle.job_id());
                if executing != Some(job_id) {
                    return Ok(Stay);
                }
                debug!(channel = id, %job_id, "cancelling job on node");
                channel.start_send(&WireMessage::CancelJob { job_id })?;
                Ok(ToCancellingJob)
            }
        }
    }

    fn transitions(&self) -> &'static [NodeTransition] {
        &[Stay, ToIdle, ToCancellingJob, ToClosed]
    }
}

struct CancellingJobHandler;

#[async_trait]
impl StateHandler<NodeTransition, NodeContext> for CancellingJobHandler {
    async fn perform(&self, channel: &mut Channel<NodeContext>) -> Result<NodeTransition> {
        if channel.send_pending().await? {
            Ok(ToWaitingForResults)
        } else {
            Ok(Stay)
        }
    }

    fn transitions(&self) -> &'static [NodeTransition] {
        &[Stay, ToWaitingForResults]
    }
}

/// Forwards job cancellations to the node server without keeping it alive.
struct CancelForwarder(Weak<Shared>);

impl CancelHook for CancelForwarder {
    fn job_cancelled(&self, job_id: Uuid) {
        let Some(shared) = self.0.upgrade() else {
            return;
        };
        let targets: Vec<ChannelId> = shared
            .nodes
            .iter()
            .filter(|info| info.executing == Some(job_id))
            .map(|info| info.channel)
            .collect();
        for id in targets {
            shared.cancels.insert(id, job_id);
            shared.wake(id);
        }
    }
}

pub struct NodeServer {
    shared: Arc<Shared>,
    machine: StateMachine<NodeState, NodeTransition, NodeContext>,
}

impl NodeServer {
    pub fn new(
        driver_uuid: Uuid,
        queue: Arc<JobQueue>,
        jobs: Arc<JobRegistry>,
        reference: Arc<BundlerReference>,
    ) -> std::result::Result<Arc<Self>, TransportError> {
        let idle = Arc::new(IdleChannels::default());
        queue.add_listener(idle.clone());
        let shared = Arc::new(Shared {
            driver_uuid,
            queue,
            jobs: jobs.clone(),
            reference,
            idle,
            nodes: DashMap::new(),
            overrides: DashMap::new(),
            cancels: DashMap::new(),
        });
        jobs.add_cancel_hook(Arc::new(CancelForwarder(Arc::downgrade(&shared))));
        let machine = Self::build_machine(&shared)?;
        Ok(Arc::new(Self { shared, machine }))
    }

    fn build_machine(
        shared: &Arc<Shared>,
    ) -> std::result::Result<StateMachine<NodeState, NodeTransition, NodeContext>, TransportError> {
        use NodeState::*;
        let read = Interest::READABLE;
        let write = Interest::WRITABLE;
        StateMachineBuilder::new("node-server")
            .initial(AwaitingHandshake, read)
            .terminal(Closed)
            .handler(AwaitingHandshake, Arc::new(AwaitingHandshakeHandler(shared.clone())))
            .handler(Idle, Arc::new(IdleHandler(shared.clone())))
            .handler(SendingBundle, Arc::new(SendingBundleHandler(shared.clone())))
            .handler(WaitingForResults, Arc::new(WaitingForResultsHandler(shared.clone())))
            .handler(CancellingJob, Arc::new(CancellingJobHandler))
            .transition(AwaitingHandshake, Stay, AwaitingHandshake, read)
            .transition(AwaitingHandshake, ToIdle, Idle, read)
            .transition(AwaitingHandshake, ToClosed, Closed, Interest::NONE)
            .transition(Idle, ToIdle, Idle, read)
            .transition(Idle, ToSendingBundle, SendingBundle, Interest::BOTH)
            .transition(Idle, ToClosed, Closed, Interest::NONE)
            .transition(SendingBundle, Stay, SendingBundle, Interest::BOTH)
            .transition(SendingBundle, ToWaitingForResults, WaitingForResults, read)
            .transition(WaitingForResults, Stay, WaitingForResults, read)
            .transition(WaitingForResults, ToIdle, Idle, read)
            .transition(WaitingForResults, ToCancellingJob, CancellingJob, write)
            .transition(WaitingForResults, ToClosed, Closed, Interest::NONE)
            .transition(CancellingJob, Stay, CancellingJob, write)
            .transition(CancellingJob, ToWaitingForResults, WaitingForResults, read)
            .build()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.shared.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by_key(|n| n.channel);
        nodes
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.len()
    }

    /// Pins `channel` to a bundler built from `settings`, or unpins it with `None`.
    /// Takes effect before the channel's next round.
    pub fn pin_bundler(&self, channel: ChannelId, settings: Option<BundlerSettings>) -> bool {
        if !self.shared.nodes.contains_key(&channel) {
            return false;
        }
        self.shared.overrides.insert(channel, settings);
        true
    }
}

#[async_trait]
impl ChannelServer for NodeServer {
    type State = NodeState;
    type Transition = NodeTransition;
    type Context = NodeContext;

    fn state_machine(&self) -> &StateMachine<NodeState, NodeTransition, NodeContext> {
        &self.machine
    }

    fn create_context(&self, id: ChannelId, peer: SocketAddr, secure: bool) -> NodeContext {
        NodeContext {
            id,
            peer,
            secure,
            uuid: None,
            bundler: None,
            in_flight: None,
        }
    }

    fn attach(&self, handle: MultiplexerHandle) {
        let _ = self.shared.idle.handle.set(handle);
    }

    async fn on_close(&self, channel: &mut Channel<NodeContext>, state: NodeState) {
        let context = channel.context_mut();
        let id = context.id;
        self.shared.idle.remove(id);
        self.shared.nodes.remove(&id);
        self.shared.overrides.remove(&id);
        self.shared.cancels.remove(&id);
        if let Some(in_flight) = context.in_flight.take() {
            info!(
                channel = id,
                ?state,
                bundle_id = in_flight.bundle.id,
                tasks = in_flight.bundle.task_count(),
                "node lost, requeueing its bundle"
            );
            self.shared.return_slice(in_flight.bundle);
        } else {
            info!(channel = id, ?state, node = ?context.uuid, "node disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::testing::tasks;
    use crate::bundler::BundlerRegistry;
    use jobgrid_transport::{
        ConnectionMultiplexer, FramedConnection, JobHeader, JobSubmission, MultiplexerConfig,
        TaskResult, TaskSpec, TransitionMode,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<JobQueue>,
        jobs: Arc<JobRegistry>,
        server: Arc<NodeServer>,
        handle: MultiplexerHandle,
        addr: SocketAddr,
    }

    async fn fixture(settings: BundlerSettings) -> Fixture {
        let queue = Arc::new(JobQueue::new());
        let jobs = Arc::new(JobRegistry::new(queue.clone()));
        let reference = Arc::new(
            BundlerReference::new(Arc::new(BundlerRegistry::default()), settings).unwrap(),
        );
        let server = NodeServer::new(Uuid::new_v4(), queue.clone(), jobs.clone(), reference).unwrap();
        let mut config = MultiplexerConfig::new("nodes");
        config.listen = vec!["127.0.0.1:0".parse().unwrap()];
        config.mode = TransitionMode::Sequential;
        let mux = ConnectionMultiplexer::bind(config, server.clone()).await.unwrap();
        let addr = mux.local_addrs()[0];
        let handle = mux.handle();
        tokio::spawn(mux.run());
        Fixture {
            queue,
            jobs,
            server,
            handle,
            addr,
        }
    }

    async fn connect_node(addr: SocketAddr, uuid: Uuid) -> FramedConnection {
        let mut conn = FramedConnection::connect(addr, None).await.unwrap();
        conn.send(&WireMessage::Handshake(Handshake {
            role: PeerRole::Node,
            protocol_version: PROTOCOL_VERSION,
            uuid,
            processing_threads: Some(1),
        }))
        .await
        .unwrap();
        conn
    }

    fn submit(jobs: &JobRegistry, count: u32, uuid_path: Vec<Uuid>) -> Uuid {
        submit_tasks(jobs, tasks(count), uuid_path)
    }

    fn submit_tasks(jobs: &JobRegistry, tasks: Vec<TaskSpec>, uuid_path: Vec<Uuid>) -> Uuid {
        let job_id = Uuid::new_v4();
        jobs.submit(
            None,
            JobSubmission {
                header: JobHeader {
                    job_id,
                    name: "job".into(),
                    priority: 0,
                    metadata: BTreeMap::new(),
                    uuid_path,
                },
                tasks,
            },
        )
        .unwrap();
        job_id
    }

    async fn next_bundle(conn: &mut FramedConnection) -> jobgrid_transport::BundleDispatch {
        match tokio::time::timeout(Duration::from_secs(5), conn.expect()).await {
            Ok(Ok(WireMessage::Bundle(bundle))) => bundle,
            other => panic!("expected bundle, got {:?}", other.map(|r| r.map(|m| m.kind()))),
        }
    }

    fn completed(bundle: &jobgrid_transport::BundleDispatch) -> WireMessage {
        WireMessage::BundleResults(BundleResults {
            bundle_id: bundle.bundle_id,
            job_id: bundle.job_id,
            results: bundle
                .tasks
                .iter()
                .map(|t| TaskResult {
                    position: t.position,
                    outcome: TaskOutcome::Completed(t.payload.clone()),
                    elapsed_nanos: 1,
                    cpu_nanos: 1,
                })
                .collect(),
            requeue: false,
            processing_threads: None,
        })
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_rounds_follow_bundler_size() {
        let f = fixture(BundlerSettings::manual(4, 4)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        let job_id = submit(&f.jobs, 10, Vec::new());

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let bundle = next_bundle(&mut node).await;
            assert_eq!(bundle.job_id, job_id);
            sizes.push(bundle.tasks.len());
            node.send(&completed(&bundle)).await.unwrap();
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        wait_for(|| !f.jobs.is_active(job_id)).await;
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_cycle_leaves_bundle_for_other_nodes() {
        let f = fixture(BundlerSettings::manual(10, 10)).await;
        let looped = Uuid::new_v4();
        submit(&f.jobs, 3, vec![looped]);
        let mut first = connect_node(f.addr, looped).await;
        wait_for(|| f.queue.stats().bundles_requeued >= 1).await;
        wait_for(|| f.server.idle_count() == 1).await;
        assert_eq!(f.queue.task_count(), 3);
        assert!(tokio::time::timeout(Duration::from_millis(200), first.recv()).await.is_err());

        let mut second = connect_node(f.addr, Uuid::new_v4()).await;
        let bundle = next_bundle(&mut second).await;
        assert_eq!(bundle.tasks.len(), 3);
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_requeues_in_flight() {
        let f = fixture(BundlerSettings::manual(5, 5)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        submit(&f.jobs, 5, Vec::new());
        let bundle = next_bundle(&mut node).await;
        assert_eq!(bundle.tasks.len(), 5);
        assert!(f.queue.is_empty());

        drop(node);
        wait_for(|| f.queue.task_count() == 5).await;

        let mut other = connect_node(f.addr, Uuid::new_v4()).await;
        assert_eq!(next_bundle(&mut other).await.tasks.len(), 5);
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_requeue_flag_returns_cancelled_tasks() {
        let f = fixture(BundlerSettings::manual(4, 4)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        submit(&f.jobs, 4, Vec::new());
        let bundle = next_bundle(&mut node).await;

        let mut reply = completed(&bundle);
        if let WireMessage::BundleResults(results) = &mut reply {
            results.requeue = true;
            results.results[2].outcome = TaskOutcome::Cancelled;
            results.results[3].outcome = TaskOutcome::Cancelled;
        }
        node.send(&reply).await.unwrap();

        let again = next_bundle(&mut node).await;
        let positions: Vec<u32> = again.tasks.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![2, 3]);
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_message_while_idle_closes_channel() {
        let f = fixture(BundlerSettings::manual(1, 1)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        wait_for(|| f.server.nodes().len() == 1).await;
        node.send(&WireMessage::CancelJob { job_id: Uuid::nil() })
            .await
            .unwrap();
        assert_eq!(node.recv().await.ok().flatten(), None);
        wait_for(|| f.server.nodes().is_empty()).await;
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let f = fixture(BundlerSettings::default()).await;
        let mut conn = FramedConnection::connect(f.addr, None).await.unwrap();
        conn.send(&WireMessage::Handshake(Handshake {
            role: PeerRole::Node,
            protocol_version: PROTOCOL_VERSION + 1,
            uuid: Uuid::new_v4(),
            processing_threads: None,
        }))
        .await
        .unwrap();
        assert_eq!(conn.recv().await.ok().flatten(), None);
        assert!(f.server.nodes().is_empty());
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_reaches_executing_node() {
        let f = fixture(BundlerSettings::manual(2, 2)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        let job_id = submit(&f.jobs, 2, Vec::new());
        let bundle = next_bundle(&mut node).await;
        wait_for(|| f.server.nodes()[0].executing == Some(job_id)).await;

        f.jobs.cancel_job(job_id).unwrap();
        match tokio::time::timeout(Duration::from_secs(5), node.expect()).await {
            Ok(Ok(WireMessage::CancelJob { job_id: cancelled })) => assert_eq!(cancelled, job_id),
            other => panic!("expected cancel, got {:?}", other.map(|r| r.map(|m| m.kind()))),
        }

        // the round still ends normally; its results are dropped
        node.send(&completed(&bundle)).await.unwrap();
        wait_for(|| f.server.nodes()[0].executing.is_none()).await;
        assert!(f.queue.is_empty());
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_during_bundle_send_reaches_node() {
        let f = fixture(BundlerSettings::manual(1, 1)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        let large = TaskSpec {
            position: 0,
            kind: "echo".into(),
            payload: vec![7u8; 32 << 20],
            timeout: None,
        };
        let job_id = submit_tasks(&f.jobs, vec![large], Vec::new());
        // the node is not reading, so the bundle is still being written
        wait_for(|| f.server.nodes()[0].executing == Some(job_id)).await;
        f.jobs.cancel_job(job_id).unwrap();

        let bundle = next_bundle(&mut node).await;
        assert_eq!(bundle.job_id, job_id);
        match tokio::time::timeout(Duration::from_secs(5), node.expect()).await {
            Ok(Ok(WireMessage::CancelJob { job_id: cancelled })) => assert_eq!(cancelled, job_id),
            other => panic!("expected cancel, got {:?}", other.map(|r| r.map(|m| m.kind()))),
        }
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_omitted_results_are_requeued() {
        let f = fixture(BundlerSettings::manual(2, 2)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        let job_id = submit(&f.jobs, 2, Vec::new());
        let bundle = next_bundle(&mut node).await;
        assert_eq!(bundle.tasks.len(), 2);

        let mut reply = completed(&bundle);
        if let WireMessage::BundleResults(results) = &mut reply {
            results.results.truncate(1);
        }
        node.send(&reply).await.unwrap();

        let again = next_bundle(&mut node).await;
        let positions: Vec<u32> = again.tasks.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![1]);
        assert!(f.jobs.is_active(job_id));
        node.send(&completed(&again)).await.unwrap();
        wait_for(|| !f.jobs.is_active(job_id)).await;
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_results_for_another_job_close_and_requeue() {
        let f = fixture(BundlerSettings::manual(2, 2)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        let job_id = submit(&f.jobs, 2, Vec::new());
        let bundle = next_bundle(&mut node).await;

        let mut reply = completed(&bundle);
        if let WireMessage::BundleResults(results) = &mut reply {
            results.job_id = Uuid::new_v4();
        }
        node.send(&reply).await.unwrap();
        assert_eq!(node.recv().await.ok().flatten(), None);
        wait_for(|| f.queue.task_count() == 2).await;
        assert!(f.jobs.is_active(job_id));

        let mut other = connect_node(f.addr, Uuid::new_v4()).await;
        let again = next_bundle(&mut other).await;
        assert_eq!(again.tasks.len(), 2);
        f.handle.shutdown();
    }

    #[tokio::test]
    async fn test_duplicate_positions_rejected() {
        let f = fixture(BundlerSettings::manual(2, 2)).await;
        let mut node = connect_node(f.addr, Uuid::new_v4()).await;
        submit(&f.jobs, 2, Vec::new());
        let bundle = next_bundle(&mut node).await;

        let mut reply = completed(&bundle);
        if let WireMessage::BundleResults(results) = &mut reply {
            results.results[1].position = results.results[0].position;
        }
        node.send(&reply).await.unwrap();
        assert_eq!(node.recv().await.ok().flatten(), None);
        wait_for(|| f.queue.task_count() == 2).await;
        f.handle.shutdown();
    }
}
