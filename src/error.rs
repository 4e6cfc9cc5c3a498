//! Error taxonomy shared by the service, the clients and the engine.
//!
//! Real-time overflow/underflow never surface here; the ring buffer absorbs
//! them and counts them in its header.

use std::io;
use std::path::PathBuf;

use crate::protocol::ErrorCode;

/// A gain command was rejected before it reached the store.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum ValidationError {
    /// Application identifier was the empty string.
    #[error("application identifier is empty")]
    EmptyIdentifier,
    /// Application identifier exceeded the 255 byte wire field.
    #[error("application identifier is {len} bytes, maximum is 255")]
    IdentifierTooLong {
        /// Length of the offending identifier in bytes.
        len: usize,
    },
    /// Gain was NaN or outside `[0.0, 1.0]`.
    #[error("gain {0} is outside [0.0, 1.0]")]
    GainOutOfRange(f32),
}

impl ValidationError {
    /// Wire code reported back to the client for this rejection.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyIdentifier => ErrorCode::EmptyIdentifier,
            Self::IdentifierTooLong { .. } => ErrorCode::IdentifierTooLong,
            Self::GainOutOfRange(_) => ErrorCode::GainOutOfRange,
        }
    }
}

/// Framing failures on the RPC channel.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// First byte of a request did not name a known operation.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// First byte of a response was not a known status.
    #[error("unknown response status {0:#04x}")]
    UnknownStatus(u8),
    /// Identifier bytes were not valid UTF-8.
    #[error("application identifier is not valid UTF-8")]
    InvalidIdentifier,
    /// A well formed response that does not answer the request sent.
    #[error("response does not match the request")]
    UnexpectedResponse,
    /// Snapshot response announced more entries than the client accepts.
    #[error("snapshot of {0} entries exceeds the protocol limit")]
    TooManyEntries(u32),
    /// Underlying transport failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced to callers of [`GainClient`](crate::client::GainClient).
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// The service socket could not be reached.
    #[error("gain service unreachable at {path}: {source}")]
    Unreachable {
        /// Socket path that was dialled.
        path: PathBuf,
        /// Connect error reported by the OS.
        source: io::Error,
    },
    /// The service did not answer within the request timeout.
    #[error("gain service did not respond in time")]
    Timeout,
    /// The connection dropped in the middle of a request.
    #[error("connection to gain service lost: {0}")]
    Disconnected(io::Error),
    /// The service rejected the request.
    #[error("gain service rejected request: {0}")]
    Rejected(ErrorCode),
    /// The service answered with something that could not be decoded.
    #[error(transparent)]
    Protocol(ProtocolError),
    /// The request could not be encoded.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ClientError {
    /// Whether retrying later might succeed.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::Timeout | Self::Disconnected(_)
        )
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io) => match io.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout,
                _ => Self::Disconnected(io),
            },
            other => Self::Protocol(other),
        }
    }
}

/// Failures while starting or running the passthrough engine.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The system reports no default output device.
    #[error("no default output device available")]
    DeviceUnavailable,
    /// The output device refused our render callback.
    #[error("output device refused render callback: {0}")]
    CallbackInstallFailed(String),
    /// The callback was installed but the device would not start IO.
    #[error("output device failed to start: {0}")]
    StartFailed(String),
}

/// Failures of the authoritative service itself.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    /// A listening socket could not be bound.
    #[error("cannot bind {path}: {source}")]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// OS error.
        source: io::Error,
    },
    /// Any other I/O failure during setup.
    #[error(transparent)]
    Io(#[from] io::Error),
}
