use std::time::Duration;
use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Coarse failure category, stable across drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    HandshakeFailure,
    TransactionTimeout,
    Transport,
    ProtocolConsistency,
    UnsupportedOperation,
    NotConnected,
    EventQueueOverflow,
    InvalidAddress,
    Codec,
    Configuration,
    Device,
}

/// Driver specific errors
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Connect attempt failed during transport setup or parameter negotiation.
    #[error("Handshake failed during {stage}: {reason}")]
    HandshakeFailure { stage: &'static str, reason: String },

    /// No response arrived within the per-request deadline.
    #[error("Request timed out after {0:?}")]
    TransactionTimeout(Duration),

    /// Underlying link failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response shape does not line up with the request.
    #[error("Protocol consistency error: {0}")]
    ProtocolConsistency(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Not connected")]
    NotConnected,

    /// Unsolicited event volume exceeded the ingestion queue.
    #[error("Event queue overflow (capacity {capacity})")]
    EventQueueOverflow { capacity: usize },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Device answered with a header-level error.
    #[error("Device error: class=0x{class:02X} code=0x{code:02X}")]
    Device { class: u8, code: u8 },
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::HandshakeFailure { .. } => ErrorKind::HandshakeFailure,
            DriverError::TransactionTimeout(_) => ErrorKind::TransactionTimeout,
            DriverError::Transport(_) => ErrorKind::Transport,
            DriverError::ProtocolConsistency(_) => ErrorKind::ProtocolConsistency,
            DriverError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            DriverError::NotConnected => ErrorKind::NotConnected,
            DriverError::EventQueueOverflow { .. } => ErrorKind::EventQueueOverflow,
            DriverError::InvalidAddress(_) => ErrorKind::InvalidAddress,
            DriverError::Codec(_) => ErrorKind::Codec,
            DriverError::Configuration(_) => ErrorKind::Configuration,
            DriverError::Device { .. } => ErrorKind::Device,
        }
    }

    /// Timeouts and transport hiccups are worth retrying at the application level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransactionTimeout | ErrorKind::Transport | ErrorKind::NotConnected
        )
    }

    pub fn handshake(stage: &'static str, reason: impl Into<String>) -> Self {
        DriverError::HandshakeFailure {
            stage,
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for DriverError {
    fn from(e: std::io::Error) -> Self {
        DriverError::Transport(e.to_string())
    }
}
