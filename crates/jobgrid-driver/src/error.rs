use jobgrid_transport::TransportError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BundlerError {
    #[error("unknown bundler algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid bundler parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {0} has no tasks")]
    EmptyJob(Uuid),

    #[error("duplicate job id: {0}")]
    DuplicateJob(Uuid),

    #[error("driver is not running")]
    NotRunning,

    #[error(transparent)]
    Bundler(#[from] BundlerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
