//! Client transport backed by a [`MemoryBroker`].

use crate::broker::MemoryBroker;
use fieldsync_client::{
    Channel, ChannelState, ConnectionState, SyncError, SyncResult, Transport, TransportEvent,
};
use fieldsync_protocol::{ChannelMessage, CrudQuery};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;

pub(crate) struct ClientInner {
    broker: MemoryBroker,
    state: RwLock<ConnectionState>,
    channels: Mutex<HashMap<String, Channel>>,
    events: broadcast::Sender<TransportEvent>,
}

impl ClientInner {
    fn is_open(&self) -> bool {
        *self.state.read() == ConnectionState::Open
    }

    pub(crate) fn is_subscribed(&self, channel: &str) -> bool {
        self.is_open()
            && self
                .channels
                .lock()
                .get(channel)
                .is_some_and(|c| c.state() == ChannelState::Subscribed)
    }

    /// Delivers a broadcast if this client is connected and subscribed.
    pub(crate) fn deliver(&self, channel: &str, message: Option<ChannelMessage>) -> bool {
        if !self.is_open() {
            return false;
        }
        let channel = match self.channels.lock().get(channel) {
            Some(channel) if channel.state() == ChannelState::Subscribed => channel.clone(),
            _ => return false,
        };
        channel.publish(message);
        true
    }
}

/// One client connection to a [`MemoryBroker`].
///
/// Subscriptions are confirmed (or denied) asynchronously, the way a real
/// socket client would, so calls must happen inside a Tokio runtime.
pub struct MemoryTransport {
    inner: Arc<ClientInner>,
}

impl MemoryTransport {
    pub(crate) fn new(broker: MemoryBroker) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                broker,
                state: RwLock::new(ConnectionState::Open),
                channels: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    /// Returns the broker this client talks to.
    pub fn broker(&self) -> &MemoryBroker {
        &self.inner.broker
    }

    /// Drops the connection. Channels fall back to `Pending` and miss every
    /// broadcast until they are confirmed again.
    pub fn disconnect(&self) {
        *self.inner.state.write() = ConnectionState::Closed;
        for channel in self.inner.channels.lock().values() {
            channel.set_state(ChannelState::Pending);
        }
        debug!("memory transport closed");
        let _ = self.inner.events.send(TransportEvent::Close);
    }

    /// Reopens the connection.
    pub fn connect(&self) {
        *self.inner.state.write() = ConnectionState::Open;
        let _ = self.inner.events.send(TransportEvent::Connect);
    }

    /// Signals a (re)authentication; watchers re-issue their subscriptions.
    pub fn authenticate(&self) {
        *self.inner.state.write() = ConnectionState::Open;
        let _ = self.inner.events.send(TransportEvent::Authenticate);
    }

    /// Reconnects and authenticates.
    pub fn reconnect(&self) {
        self.connect();
        self.authenticate();
    }

    /// Returns a channel by name.
    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner.channels.lock().get(name).cloned()
    }

    /// Returns the names of every channel this client holds, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("state", &*self.inner.state.read())
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    fn subscribe(&self, name: &str) -> Channel {
        let channel = self
            .inner
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name, CHANNEL_CAPACITY))
            .clone();

        if self.inner.is_open() {
            channel.set_state(ChannelState::Pending);
            let outcome = self.inner.broker.subscribe_outcome(name);
            let pending = channel.clone();
            tokio::spawn(async move {
                if pending.state() == ChannelState::Pending {
                    pending.emit(outcome);
                }
            });
        }
        debug!(channel = %name, "memory transport subscribe");
        channel
    }

    fn unsubscribe(&self, name: &str) {
        if let Some(channel) = self.inner.channels.lock().remove(name) {
            channel.set_state(ChannelState::Unsubscribed);
        }
        debug!(channel = %name, "memory transport unsubscribe");
    }

    async fn invoke(&self, _procedure: &str, query: CrudQuery) -> SyncResult<Value> {
        if !self.inner.is_open() {
            return Err(SyncError::NotConnected);
        }
        let broker = self.inner.broker.clone();
        broker.record_query(&query);
        broker.wait_for_rpc_gate().await;
        if !self.inner.is_open() {
            return Err(SyncError::NotConnected);
        }
        broker.apply(query)
    }

    fn listener(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_client::ChannelEvent;
    use fieldsync_protocol::FieldKey;
    use serde_json::json;

    const CHANNEL: &str = "crud>Product/1/name";

    #[tokio::test]
    async fn confirms_subscriptions_asynchronously() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        let channel = client.subscribe(CHANNEL);
        let mut events = channel.listener();
        assert_eq!(channel.state(), ChannelState::Pending);

        assert_eq!(events.recv().await.unwrap(), ChannelEvent::Subscribe);
        assert_eq!(broker.subscriber_count(CHANNEL), 1);
    }

    #[tokio::test]
    async fn denies_blocked_channels() {
        let broker = MemoryBroker::new();
        broker.deny_channel(CHANNEL, json!("forbidden"));
        let client = broker.client();
        let mut events = client.subscribe(CHANNEL).listener();

        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::SubscribeFail(json!("forbidden"))
        );
        assert_eq!(broker.subscriber_count(CHANNEL), 0);
    }

    #[tokio::test]
    async fn broadcasts_reach_other_clients() {
        let broker = MemoryBroker::new();
        let writer = broker.client();
        let reader = broker.client();
        let channel = reader.subscribe(CHANNEL);
        let mut listener = channel.listener();
        let mut messages = channel.messages();
        listener.recv().await.unwrap();

        let key = FieldKey::new("Product", "1", "name");
        writer
            .invoke("crud", CrudQuery::update(&key, json!("Lamp"), None))
            .await
            .unwrap();

        let message = messages.recv().await.unwrap().unwrap();
        assert_eq!(message.value, Some(json!("Lamp")));
    }

    #[tokio::test]
    async fn disconnected_clients_reject_rpcs() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        let mut lifecycle = client.listener();
        client.disconnect();

        assert_eq!(lifecycle.recv().await.unwrap(), TransportEvent::Close);
        let key = FieldKey::new("Product", "1", "name");
        assert_eq!(
            client.invoke("crud", CrudQuery::read(&key, None)).await,
            Err(SyncError::NotConnected)
        );
        assert!(broker.queries().is_empty());
    }

    #[tokio::test]
    async fn disconnect_resets_channels_to_pending() {
        let broker = MemoryBroker::new();
        let client = broker.client();
        let channel = client.subscribe(CHANNEL);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(channel.state(), ChannelState::Subscribed);

        client.disconnect();
        assert_eq!(channel.state(), ChannelState::Pending);
        assert_eq!(broker.subscriber_count(CHANNEL), 0);
    }
}
