//! Client-facing channel server: accepts job submissions and cancellations and streams
//! results back as nodes return them.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use jobgrid_transport::{
    Channel, ChannelId, ChannelServer, Handshake, Interest, PeerRole, Received, StateHandler,
    StateMachine, StateMachineBuilder, TransportError, WireMessage, PROTOCOL_VERSION,
};
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::job::{ClientOutbox, JobRegistry};

type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    AwaitingHandshake,
    WaitingJob,
    SendingResults,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientTransition {
    ToWaitingJob,
    ToSendingResults,
    ToClosed,
    Stay,
}

use ClientTransition::*;

pub struct ClientContext {
    id: ChannelId,
    peer: SocketAddr,
    outbox: Arc<ClientOutbox>,
}

fn violation(reason: impl Into<String>) -> TransportError {
    TransportError::ProtocolViolation {
        reason: reason.into(),
    }
}

struct AwaitingHandshakeHandler;

#[async_trait]
impl StateHandler<ClientTransition, ClientContext> for AwaitingHandshakeHandler {
    async fn perform(&self, channel: &mut Channel<ClientContext>) -> Result<ClientTransition> {
        match channel.receive().await? {
            Received::Message(WireMessage::Handshake(Handshake {
                role: PeerRole::Client,
                protocol_version,
                uuid,
                ..
            })) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(TransportError::VersionMismatch {
                        expected: PROTOCOL_VERSION,
                        got: protocol_version,
                    });
                }
                let context = channel.context();
                info!(channel = context.id, peer = %context.peer, client = %uuid, "client connected");
                Ok(ToWaitingJob)
            }
            Received::Message(other) => Err(violation(format!(
                "expected client handshake, got {}",
                other.kind()
            ))),
            Received::Pending => Ok(Stay),
            Received::Closed => Ok(ToClosed),
        }
    }

    fn transitions(&self) -> &'static [ClientTransition] {
        &[Stay, ToWaitingJob, ToClosed]
    }
}

struct WaitingJobHandler(Arc<JobRegistry>);

#[async_trait]
impl StateHandler<ClientTransition, ClientContext> for WaitingJobHandler {
    async fn perform(&self, channel: &mut Channel<ClientContext>) -> Result<ClientTransition> {
        if let Some(message) = channel.context().outbox.pop() {
            channel.start_send(&message)?;
            return Ok(ToSendingResults);
        }
        if !channel.is_readable() {
            return Ok(Stay);
        }

        let id = channel.id();
        match channel.receive().await? {
            Received::Message(WireMessage::JobSubmission(submission)) => {
                let job_id = submission.header.job_id;
                if let Err(e) = self.0.submit(Some(id), submission) {
                    warn!(channel = id, %job_id, error = %e, "job rejected");
                    channel.context().outbox.push(WireMessage::JobCancelled { job_id });
                }
                self.flush(channel)
            }
            Received::Message(WireMessage::CancelJob { job_id }) => {
                match self.0.cancel_job(job_id) {
                    Ok(_) => {}
                    Err(DriverError::JobNotFound(_)) => {
                        debug!(channel = id, %job_id, "cancel for unknown job")
                    }
                    Err(e) => warn!(channel = id, %job_id, error = %e, "cancel failed"),
                }
                self.flush(channel)
            }
            Received::Message(other) => Err(violation(format!(
                "client sent {} while waiting for jobs",
                other.kind()
            ))),
            Received::Pending => Ok(Stay),
            Received::Closed => Ok(ToClosed),
        }
    }

    fn transitions(&self) -> &'static [ClientTransition] {
        &[Stay, ToSendingResults, ToClosed]
    }
}

impl WaitingJobHandler {
    /// Starts sending the next queued message, if any.
    fn flush(&self, channel: &mut Channel<ClientContext>) -> Result<ClientTransition> {
        match channel.context().outbox.pop() {
            Some(message) => {
                channel.start_send(&message)?;
                Ok(ToSendingResults)
            }
            None => Ok(Stay),
        }
    }
}

struct SendingResultsHandler;

#[async_trait]
impl StateHandler<ClientTransition, ClientContext> for SendingResultsHandler {
    async fn perform(&self, channel: &mut Channel<ClientContext>) -> Result<ClientTransition> {
        if !channel.send_pending().await? {
            return Ok(Stay);
        }
        match channel.context().outbox.pop() {
            Some(message) => {
                channel.start_send(&message)?;
                Ok(Stay)
            }
            None => Ok(ToWaitingJob),
        }
    }

    fn transitions(&self) -> &'static [ClientTransition] {
        &[Stay, ToWaitingJob]
    }
}

pub struct ClientServer {
    jobs: Arc<JobRegistry>,
    machine: StateMachine<ClientState, ClientTransition, ClientContext>,
}

impl ClientServer {
    pub fn new(jobs: Arc<JobRegistry>) -> std::result::Result<Arc<Self>, TransportError> {
        use ClientState::*;
        let read = Interest::READABLE;
        let machine = StateMachineBuilder::new("client-server")
            .initial(AwaitingHandshake, read)
            .terminal(Closed)
            .handler(AwaitingHandshake, Arc::new(AwaitingHandshakeHandler))
            .handler(WaitingJob, Arc::new(WaitingJobHandler(jobs.clone())))
            .handler(SendingResults, Arc::new(SendingResultsHandler))
            .transition(AwaitingHandshake, Stay, AwaitingHandshake, read)
            .transition(AwaitingHandshake, ToWaitingJob, WaitingJob, read)
            .transition(AwaitingHandshake, ToClosed, Closed, Interest::NONE)
            .transition(WaitingJob, Stay, WaitingJob, read)
            .transition(WaitingJob, ToSendingResults, SendingResults, Interest::WRITABLE)
            .transition(WaitingJob, ToClosed, Closed, Interest::NONE)
            .transition(SendingResults, Stay, SendingResults, Interest::WRITABLE)
            .transition(SendingResults, ToWaitingJob, WaitingJob, read)
            .build()?;
        Ok(Arc::new(Self { jobs, machine }))
    }
}

#[async_trait]
impl ChannelServer for ClientServer {
    type State = ClientState;
    type Transition = ClientTransition;
    type Context = ClientContext;

    fn state_machine(&self) -> &StateMachine<ClientState, ClientTransition, ClientContext> {
        &self.machine
    }

    fn create_context(&self, id: ChannelId, peer: SocketAddr, _secure: bool) -> ClientContext {
        ClientContext {
            id,
            peer,
            outbox: self.jobs.attach_client(id),
        }
    }

    fn attach(&self, handle: jobgrid_transport::MultiplexerHandle) {
        self.jobs.set_client_handle(handle);
    }

    async fn on_close(&self, channel: &mut Channel<ClientContext>, state: ClientState) {
        let context = channel.context();
        let cancelled = self.jobs.client_disconnected(context.id);
        info!(
            channel = context.id,
            peer = %context.peer,
            ?state,
            cancelled = cancelled.len(),
            "client disconnected"
        );
    }
}
