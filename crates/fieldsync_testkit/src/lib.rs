//! # fieldsync Testkit
//!
//! Test utilities for fieldsync.
//!
//! This crate provides:
//! - `MemoryBroker`: an in-memory CRUD server with pub/sub fan-out
//! - `MemoryTransport`: a client connection implementing `Transport`
//! - Connection, authentication, subscription-denial and RPC-gating controls
//! - Async fixtures and a `tracing` initialiser
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn sees_remote_writes() {
//!     let broker = MemoryBroker::new();
//!     let session = Session::new(broker.client());
//!     // ... create fields and drive the broker
//!     settle().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod fixtures;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::MemoryBroker;
    pub use crate::fixtures::*;
    pub use crate::transport::MemoryTransport;
    pub use fieldsync_client::{
        Field, FieldConfig, FieldEvent, Model, ModelConfig, ModelEvent, Session, Transport,
    };
}

pub use broker::MemoryBroker;
pub use fixtures::*;
pub use transport::MemoryTransport;
