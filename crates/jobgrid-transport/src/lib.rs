//! JobGrid transport: framed channels over plain TCP or TLS, per-channel state machines
//! and the readiness-driven connection multiplexer shared by the driver's servers.

pub mod channel;
pub mod connection;
pub mod error;
pub mod framed;
pub mod message;
pub mod metrics;
pub mod multiplexer;
pub mod protocol;
pub mod readiness;
pub mod retry;
pub mod ssl_handler;
pub mod state_machine;
pub mod tls;

pub use channel::{Channel, Received};
pub use connection::{ConnectionStream, FrameReader, FrameWriter, FramedConnection};
pub use error::{Result, TransportError};
pub use framed::{FramedChannel, PlainChannel, RawChannel, ReadStatus, WriteStatus};
pub use message::{
    BundleDispatch, BundleResults, Handshake, JobHeader, JobResults, JobSubmission, PeerRole,
    TaskOutcome, TaskResult, TaskSpec, TimeoutSchedule, WireMessage,
};
pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use multiplexer::{
    ChannelServer, ConnectionMultiplexer, MultiplexerConfig, MultiplexerHandle, TransitionMode,
};
pub use protocol::{MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
pub use readiness::{ChannelId, Interest, Readiness, ReadinessSource, TokioReadiness};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
pub use ssl_handler::SslHandler;
pub use state_machine::{StateHandler, StateMachine, StateMachineBuilder, StepOutcome};
pub use tls::{TlsConfig, TlsConnector};
