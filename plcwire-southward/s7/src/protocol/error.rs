use plcwire_sdk::DriverError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Frame and codec level errors.
///
/// These never cross the public API directly; they are folded into
/// [`DriverError`] by the session layer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame")]
    InvalidFrame,

    #[error("Insufficient data: needed {needed} bytes, available {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Protocol violation: {context}")]
    ProtocolViolation { context: &'static str },

    #[error("Unexpected PDU: {context}")]
    UnexpectedPdu { context: &'static str },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Value does not match data type {expected}")]
    ValueTypeMismatch { expected: &'static str },

    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature { feature: &'static str },
}

impl From<Error> for DriverError {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => DriverError::Transport(e.to_string()),
            Error::InvalidAddress(a) => DriverError::InvalidAddress(a),
            Error::UnsupportedFeature { feature } => {
                DriverError::UnsupportedOperation(feature.to_string())
            }
            Error::UnexpectedPdu { context } => DriverError::ProtocolConsistency(context.into()),
            other => DriverError::Codec(other.to_string()),
        }
    }
}
