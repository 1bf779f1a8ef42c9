//! Transport-scoped session state.

use crate::config::SessionConfig;
use crate::field::Field;
use crate::registry::SharedRegistry;
use crate::transport::Transport;
use fieldsync_protocol::{FieldKey, PublisherId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct SessionInner<T: Transport> {
    id: Uuid,
    transport: Arc<T>,
    config: SessionConfig,
    channel_watchers: SharedRegistry<String, ()>,
    fields: SharedRegistry<FieldKey, Field<T>>,
    next_publisher: AtomicU64,
}

/// Everything fields and models share on one transport connection.
///
/// A session owns two reference-counted tables: channel watchers (one
/// token per live [`Field`] on a channel, driving unsubscribe) and shared
/// fields (one token per [`Model`](crate::Model) using a field, driving
/// field teardown). Cloning is cheap; every clone refers to the same state.
pub struct Session<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Creates a session with the default configuration.
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Creates a session with the given configuration.
    pub fn with_config(transport: Arc<T>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                transport,
                config,
                channel_watchers: SharedRegistry::new(),
                fields: SharedRegistry::new(),
                next_publisher: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Issues a publisher id unique to this session.
    pub fn next_publisher_id(&self) -> PublisherId {
        let n = self.inner.next_publisher.fetch_add(1, Ordering::SeqCst);
        PublisherId::new(format!("{}/{n}", self.inner.id))
    }

    /// Returns the number of shared fields held by models.
    pub fn field_count(&self) -> usize {
        self.inner.fields.len()
    }

    /// Returns the number of models watching a field.
    pub fn watcher_count(&self, key: &FieldKey) -> usize {
        self.inner.fields.watcher_count(key)
    }

    /// Returns the shared field for `key`, if a model holds it.
    pub fn shared_field(&self, key: &FieldKey) -> Option<Field<T>> {
        self.inner.fields.get(key)
    }

    /// Returns the number of live fields on a channel.
    pub fn channel_watcher_count(&self, channel: &str) -> usize {
        self.inner.channel_watchers.watcher_count(&channel.to_string())
    }

    pub(crate) fn channel_watchers(&self) -> &SharedRegistry<String, ()> {
        &self.inner.channel_watchers
    }

    pub(crate) fn fields(&self) -> &SharedRegistry<FieldKey, Field<T>> {
        &self.inner.fields
    }
}
