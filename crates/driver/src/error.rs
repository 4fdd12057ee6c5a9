//! Driver-wide error type (§7). One flat enum: `#[error("...")]` messages,
//! `#[from]` conversions where a source error exists, and structured fields
//! (command code, address) instead of pre-formatted strings so callers can
//! match on the cause.

use shared::node::{Address, NodeCodecError};
use shared::transport::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("transport lost")]
    TransportLost,

    #[error("command 0x{command:02x} timed out after {retries} retries")]
    Timeout { command: u8, retries: u32 },

    #[error("device rejected command 0x{command:02x}")]
    DeviceRejected { command: u8 },

    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    #[error("integrity violation at {address:?}: {detail}")]
    InvariantViolation { address: Address, detail: String },

    #[error("request was cancelled")]
    Cancelled,

    #[error("import file malformed: {detail}")]
    ImportMalformed { detail: String },

    #[error("cryptographic failure")]
    CryptoFailure,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export codec error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<FrameError> for DriverError {
    fn from(e: FrameError) -> Self {
        DriverError::ProtocolViolation {
            detail: e.to_string(),
        }
    }
}

impl From<NodeCodecError> for DriverError {
    fn from(e: NodeCodecError) -> Self {
        DriverError::ProtocolViolation {
            detail: e.to_string(),
        }
    }
}

impl DriverError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        DriverError::ProtocolViolation {
            detail: detail.into(),
        }
    }

    pub fn invariant(address: Address, detail: impl Into<String>) -> Self {
        DriverError::InvariantViolation {
            address,
            detail: detail.into(),
        }
    }

    pub fn into_rpc(self) -> (shared::rpc::ErrorKind, String) {
        use shared::rpc::ErrorKind;
        let message = self.to_string();
        let kind = match self {
            DriverError::TransportLost => ErrorKind::TransportLost,
            DriverError::Timeout { .. } => ErrorKind::Timeout,
            DriverError::DeviceRejected { command } => ErrorKind::DeviceRejected { command },
            DriverError::ProtocolViolation { detail } => ErrorKind::ProtocolViolation { detail },
            DriverError::InvariantViolation { detail, .. } => {
                ErrorKind::InvariantViolation { detail }
            }
            DriverError::Cancelled => ErrorKind::Cancelled,
            DriverError::ImportMalformed { detail } => ErrorKind::ImportMalformed { detail },
            DriverError::CryptoFailure => ErrorKind::CryptoFailure,
            DriverError::Io(_) | DriverError::Json(_) => ErrorKind::ProtocolViolation {
                detail: message.clone(),
            },
        };
        (kind, message)
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
