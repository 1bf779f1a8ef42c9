//! In-memory CRUD broker.
//!
//! Stores resource fields, answers `crud` queries and fans broadcasts out
//! to every connected [`MemoryTransport`] subscribed to the field channel.

use crate::transport::{ClientInner, MemoryTransport};
use fieldsync_client::{ChannelEvent, SyncError, SyncResult};
use fieldsync_protocol::{
    ChannelMessage, CrudAction, CrudQuery, FieldKey, FieldTransformation, PublisherId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;

pub(crate) struct BrokerInner {
    records: Mutex<HashMap<FieldKey, Value>>,
    clients: Mutex<Vec<Weak<ClientInner>>>,
    denied: Mutex<HashMap<String, Value>>,
    queries: Mutex<Vec<CrudQuery>>,
    rpc_gate: watch::Sender<bool>,
}

/// Shared in-memory server for a group of test clients.
///
/// Cloning is cheap; every clone refers to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        let (rpc_gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(BrokerInner {
                records: Mutex::new(HashMap::new()),
                clients: Mutex::new(Vec::new()),
                denied: Mutex::new(HashMap::new()),
                queries: Mutex::new(Vec::new()),
                rpc_gate,
            }),
        }
    }

    /// Creates a connected, authenticated client transport.
    pub fn client(&self) -> Arc<MemoryTransport> {
        let transport = MemoryTransport::new(self.clone());
        self.inner.clients.lock().push(transport.downgrade());
        Arc::new(transport)
    }

    /// Returns the number of live clients.
    pub fn client_count(&self) -> usize {
        let mut clients = self.inner.clients.lock();
        clients.retain(|client| client.strong_count() > 0);
        clients.len()
    }

    /// Returns a stored field value.
    pub fn record(&self, key: &FieldKey) -> Option<Value> {
        self.inner.records.lock().get(key).cloned()
    }

    /// Writes a field server-side and broadcasts the update without a
    /// publisher id.
    pub fn set_record(&self, key: &FieldKey, value: Value) {
        self.inner.records.lock().insert(key.clone(), value.clone());
        self.broadcast(key, Some(ChannelMessage::update(value, None)));
    }

    /// Writes a field server-side without broadcasting.
    pub fn seed(&self, key: &FieldKey, value: Value) {
        self.inner.records.lock().insert(key.clone(), value);
    }

    /// Removes a field server-side and broadcasts a delete.
    pub fn remove_record(&self, key: &FieldKey) {
        self.inner.records.lock().remove(key);
        self.broadcast(key, Some(ChannelMessage::delete(None)));
    }

    /// Broadcasts a payload-less message, asking watchers to reload.
    pub fn touch(&self, key: &FieldKey) {
        self.broadcast(key, None);
    }

    /// Broadcasts an arbitrary message without touching the stored record.
    pub fn publish(&self, key: &FieldKey, message: ChannelMessage) {
        self.broadcast(key, Some(message));
    }

    /// Denies future subscriptions to `channel` with a raw error payload.
    pub fn deny_channel(&self, channel: impl Into<String>, error: Value) {
        self.inner.denied.lock().insert(channel.into(), error);
    }

    /// Allows subscriptions to a previously denied channel.
    pub fn allow_channel(&self, channel: &str) {
        self.inner.denied.lock().remove(channel);
    }

    /// Holds every RPC until [`resume_rpcs`](Self::resume_rpcs).
    pub fn pause_rpcs(&self) {
        self.inner.rpc_gate.send_replace(false);
    }

    /// Releases held RPCs.
    pub fn resume_rpcs(&self) {
        self.inner.rpc_gate.send_replace(true);
    }

    /// Returns every query received, in arrival order.
    pub fn queries(&self) -> Vec<CrudQuery> {
        self.inner.queries.lock().clone()
    }

    /// Returns how many queries with `action` targeted `key`.
    pub fn query_count(&self, action: CrudAction, key: &FieldKey) -> usize {
        self.inner
            .queries
            .lock()
            .iter()
            .filter(|q| q.action == action && q.field_key().as_ref() == Some(key))
            .count()
    }

    /// Returns how many connected clients are subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.live_clients()
            .iter()
            .filter(|client| client.is_subscribed(channel))
            .count()
    }

    pub(crate) fn subscribe_outcome(&self, channel: &str) -> ChannelEvent {
        match self.inner.denied.lock().get(channel) {
            Some(error) => ChannelEvent::SubscribeFail(error.clone()),
            None => ChannelEvent::Subscribe,
        }
    }

    pub(crate) async fn wait_for_rpc_gate(&self) {
        let mut gate = self.inner.rpc_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    pub(crate) fn record_query(&self, query: &CrudQuery) {
        self.inner.queries.lock().push(query.clone());
    }

    /// Executes one `crud` query.
    pub(crate) fn apply(&self, query: CrudQuery) -> SyncResult<Value> {
        debug!(
            action = ?query.action,
            resource_type = %query.resource_type,
            resource_id = %query.resource_id,
            field = ?query.field,
            "broker query"
        );

        let Some(key) = query.field_key() else {
            if query.action != CrudAction::Delete {
                return Err(SyncError::Remote {
                    message: "a field is required".into(),
                    name: Some("InvalidArgumentsError".into()),
                });
            }
            return Ok(self.delete_resource(&query));
        };

        match query.action {
            CrudAction::Read => {
                let value = self.record(&key).unwrap_or(Value::Null);
                Ok(match query.slice_to {
                    Some(len) => FieldTransformation::slice_to(len).apply(value),
                    None => value,
                })
            }
            CrudAction::Update => {
                let value = query.value.unwrap_or(Value::Null);
                self.inner.records.lock().insert(key.clone(), value.clone());
                self.broadcast(&key, Some(ChannelMessage::update(value.clone(), query.publisher_id)));
                Ok(value)
            }
            CrudAction::Delete => {
                self.inner.records.lock().remove(&key);
                self.broadcast(&key, Some(ChannelMessage::delete(query.publisher_id)));
                Ok(Value::Null)
            }
        }
    }

    fn delete_resource(&self, query: &CrudQuery) -> Value {
        let removed: Vec<FieldKey> = {
            let mut records = self.inner.records.lock();
            let keys: Vec<FieldKey> = records
                .keys()
                .filter(|k| k.is_of_resource(&query.resource_type, &query.resource_id))
                .cloned()
                .collect();
            for key in &keys {
                records.remove(key);
            }
            keys
        };
        let publisher_id: Option<PublisherId> = query.publisher_id.clone();
        for key in &removed {
            self.broadcast(key, Some(ChannelMessage::delete(publisher_id.clone())));
        }
        Value::Null
    }

    fn broadcast(&self, key: &FieldKey, message: Option<ChannelMessage>) {
        let channel = key.channel_name();
        let delivered = self
            .live_clients()
            .iter()
            .filter(|client| client.deliver(&channel, message.clone()))
            .count();
        debug!(%channel, delivered, "broker broadcast");
    }

    fn live_clients(&self) -> Vec<Arc<ClientInner>> {
        let mut clients = self.inner.clients.lock();
        clients.retain(|client| client.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("records", &self.inner.records.lock().len())
            .field("clients", &self.client_count())
            .finish()
    }
}
