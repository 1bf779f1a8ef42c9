//! # fieldsync Protocol
//!
//! Wire types shared by fieldsync clients, transports and brokers.
//!
//! This crate provides:
//! - `FieldKey` for addressing one field of one resource
//! - `CrudQuery` payloads for the `crud` RPC procedure
//! - `ChannelMessage` broadcasts carried on `crud>type/id/name` channels
//! - `FieldTransformation` for read-side value slicing
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod key;
mod message;
mod query;
mod transform;

pub use error::{ProtocolError, ProtocolResult};
pub use key::{FieldKey, CHANNEL_PREFIX};
pub use message::{ChannelMessage, MessageType, PublisherId};
pub use query::{CrudAction, CrudQuery, CRUD_PROCEDURE};
pub use transform::FieldTransformation;
