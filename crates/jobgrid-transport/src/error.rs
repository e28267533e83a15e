use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused to {addr}")]
    ConnectionRefused { addr: String },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },

    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("no transition registered for {transition} in state {state}")]
    IllegalTransition { state: String, transition: String },

    #[error("no handler registered for state {state}")]
    MissingHandler { state: String },

    #[error("invalid state table: {reason}")]
    InvalidStateTable { reason: String },

    #[error("a message is already being written")]
    WriteInProgress,

    #[error("not connected")]
    NotConnected,

    #[error("TLS handshake failed: {reason}")]
    TlsError { reason: String },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors that a reconnect may fix.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::ConnectionRefused { .. }
            | TransportError::ConnectionReset
            | TransportError::ConnectionClosed
            | TransportError::NotConnected => true,
            TransportError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
