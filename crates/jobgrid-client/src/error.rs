use jobgrid_transport::TransportError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("connection to the driver was lost")]
    Disconnected,

    #[error("job {0} is already awaiting results")]
    DuplicateJob(Uuid),

    #[error("driver protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
