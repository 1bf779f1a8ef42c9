//! # fieldsync Client
//!
//! Realtime synchronization of individual resource fields over pub/sub
//! channels.
//!
//! This crate provides:
//! - `Field`: a live value bound to one `type/id/name` field
//! - `Model`: a resource view aggregating several fields
//! - `Session`: the per-transport scope that shares fields and channels
//! - `Transport`: the contract for the underlying socket client
//!
//! ## Architecture
//!
//! Every field subscribes to the channel `crud>type/id/name`. A broadcast on
//! that channel either carries the new value (passive mode) or prompts a
//! fresh `read` through the `crud` RPC. Local writes are optimistic: the
//! value changes at once and the RPC result is returned to the caller.
//!
//! ## Key Invariants
//!
//! - A channel is unsubscribed only when its last watcher on the session is gone
//! - Models on one session share one `Field` per field key
//! - `Load` is emitted at most once per field and once per model
//! - Reads completing while a local write is in flight are discarded
//! - Nothing is emitted after `destroy`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod event;
mod field;
mod model;
mod registry;
mod session;
mod transport;

pub use config::{FieldConfig, ModelConfig, SessionConfig};
pub use error::{SyncError, SyncResult};
pub use event::{FieldChange, FieldEvent, ModelChange, ModelEvent};
pub use field::Field;
pub use model::Model;
pub use registry::{SharedRegistry, WatcherToken};
pub use session::Session;
pub use transport::{
    Channel, ChannelEvent, ChannelState, ConnectionState, MockTransport, Transport,
    TransportEvent,
};

pub use fieldsync_protocol as protocol;
