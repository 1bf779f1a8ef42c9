//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while parsing wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A field key or channel name did not have the `type/id/name` shape.
    #[error("invalid field key: {0}")]
    InvalidKey(String),

    /// A channel broadcast could not be decoded.
    #[error("invalid channel message: {0}")]
    InvalidMessage(String),
}
