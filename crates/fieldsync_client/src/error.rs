//! Error types for field and model synchronization.

use fieldsync_protocol::ProtocolError;
use serde_json::Value;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing fields.
///
/// Errors are `Clone` so they can be delivered on broadcast event channels.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Network or transport error while invoking an RPC.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Structured error reported by the remote side.
    #[error("{}", remote_display(.message, .name))]
    Remote {
        /// Error message.
        message: String,
        /// Named error kind, if the remote side supplied one.
        name: Option<String>,
    },

    /// Error payload that was not an object, passed through as-is.
    #[error("{0}")]
    Raw(String),

    /// Channel subscription was denied.
    #[error("failed to subscribe to {channel}: {error}")]
    SubscribeFailed {
        /// Channel name.
        channel: String,
        /// Formatted cause.
        error: Box<SyncError>,
    },

    /// Not connected to the server.
    #[error("not connected to server")]
    NotConnected,

    /// The field or model was destroyed.
    #[error("destroyed")]
    Destroyed,

    /// The model does not own the named field.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// Wire protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

fn remote_display(message: &str, name: &Option<String>) -> String {
    match name {
        Some(name) => format!("{name}: {message}"),
        None => message.to_string(),
    }
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Formats a raw error payload.
    ///
    /// Objects with a `message` keep it along with their `name`, if any.
    /// Anything else passes through unchanged.
    pub fn from_raw(raw: &Value) -> Self {
        match raw {
            Value::Object(map) => match map.get("message") {
                Some(message) => Self::Remote {
                    message: message
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| message.to_string()),
                    name: map.get("name").and_then(Value::as_str).map(str::to_string),
                },
                None => Self::Raw(raw.to_string()),
            },
            Value::String(s) => Self::Raw(s.clone()),
            other => Self::Raw(other.to_string()),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::NotConnected => true,
            _ => false,
        }
    }
}
