use jobgrid_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("bundle {requested} rejected: bundle {current} is still executing")]
    AlreadyExecuting { current: u64, requested: u64 },

    #[error("reconnection requested: {0}")]
    Reconnection(String),

    #[error("invalid thread pool size {0}")]
    InvalidPoolSize(usize),

    #[error("unknown thread manager: {0}")]
    UnknownThreadManager(String),

    #[error("thread pool is shut down")]
    PoolShutdown,
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("driver protocol error: {0}")]
    Protocol(String),

    #[error("execution task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
