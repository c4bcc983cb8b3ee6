//! Error taxonomy shared by the gateway components.
//!
//! Per-frame problems ([`FormatError`], [`GatewayError::Undecryptable`]) are isolated to
//! the frame that caused them; session-level problems ([`GatewayError::ConnectionLost`])
//! move a single session into its error state. Command-style operations surface the rest
//! to the caller.

use thiserror::Error;

/// A frame or payload that does not parse. The frame is dropped; the session carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("empty frame")]
    Empty,
    #[error("frame header truncated at {0} bytes")]
    Truncated(usize),
    #[error("bad frame magic {0:02x}{1:02x}")]
    BadMagic(u8, u8),
    #[error("declared length {declared} does not match {actual} payload bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame of {0} bytes exceeds the frame size limit")]
    Oversize(usize),
    #[error("protobuf decode failed: {0}")]
    Decode(String),
    #[error("packet carries no payload")]
    MissingPayload,
    #[error("unknown or unusable port number {0}")]
    InvalidPort(i32),
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,
}

impl From<prost::DecodeError> for FormatError {
    fn from(e: prost::DecodeError) -> Self {
        FormatError::Decode(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("no key in the key ring yields a valid payload")]
    Undecryptable,
    #[error("{target} is not connected")]
    NotConnected { target: String },
    #[error("timed out waiting for {what}")]
    Timeout { what: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("device rejected the request: {0}")]
    Rejected(String),
    #[error("unknown device '{0}'")]
    UnknownDevice(String),
    #[error("unknown traceroute '{0}'")]
    UnknownTraceroute(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("mqtt: {0}")]
    Mqtt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn not_connected(target: impl Into<String>) -> Self {
        GatewayError::NotConnected {
            target: target.into(),
        }
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        GatewayError::Timeout { what: what.into() }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
