//! Transport collaborator contract.
//!
//! The transport owns the socket, channel subscriptions and RPC framing.
//! Fields and models only consume the surface defined here.

use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{ChannelMessage, CrudAction, CrudQuery, FieldKey};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection attempt is in progress.
    Connecting,
    /// The socket is open.
    Open,
    /// The socket is closed.
    Closed,
}

/// Subscription state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Subscribe request sent, not yet confirmed.
    Pending,
    /// Subscription confirmed by the server.
    Subscribed,
    /// Not subscribed.
    Unsubscribed,
}

/// Lifecycle event emitted by a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The (re)subscription succeeded.
    Subscribe,
    /// The subscription was denied; carries the raw error payload.
    SubscribeFail(Value),
}

/// Lifecycle event emitted by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket connected.
    Connect,
    /// The socket authenticated; channel subscriptions should be re-issued.
    Authenticate,
    /// The socket closed.
    Close,
}

struct ChannelInner {
    name: String,
    state: RwLock<ChannelState>,
    messages: broadcast::Sender<Option<ChannelMessage>>,
    events: broadcast::Sender<ChannelEvent>,
}

/// Handle to a named pub/sub channel.
///
/// Cloning is cheap; every clone refers to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Creates a channel in the `Pending` state.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (messages, _) = broadcast::channel(capacity.max(1));
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                state: RwLock::new(ChannelState::Pending),
                messages,
                events,
            }),
        }
    }

    /// Returns the channel name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the subscription state.
    pub fn state(&self) -> ChannelState {
        *self.inner.state.read()
    }

    /// Sets the subscription state.
    pub fn set_state(&self, state: ChannelState) {
        *self.inner.state.write() = state;
    }

    /// Returns a receiver for broadcasts. `None` means "refresh needed".
    pub fn messages(&self) -> broadcast::Receiver<Option<ChannelMessage>> {
        self.inner.messages.subscribe()
    }

    /// Returns a receiver for subscribe / subscribe-fail events.
    pub fn listener(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Delivers a broadcast to every receiver. Returns the receiver count.
    pub fn publish(&self, message: Option<ChannelMessage>) -> usize {
        self.inner.messages.send(message).unwrap_or(0)
    }

    /// Delivers a lifecycle event, updating the state accordingly.
    pub fn emit(&self, event: ChannelEvent) -> usize {
        match event {
            ChannelEvent::Subscribe => self.set_state(ChannelState::Subscribed),
            ChannelEvent::SubscribeFail(_) => self.set_state(ChannelState::Unsubscribed),
        }
        self.inner.events.send(event).unwrap_or(0)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// A transport connects fields to the server.
///
/// Implementations provide channel subscriptions, RPC invocation and
/// connection lifecycle events. `subscribe` must be idempotent per channel
/// name: calling it again re-issues the subscribe request and returns the
/// same channel.
pub trait Transport: Send + Sync + 'static {
    /// Returns the connection state.
    fn state(&self) -> ConnectionState;

    /// Returns true if the socket is open.
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Subscribes to a channel.
    fn subscribe(&self, channel: &str) -> Channel;

    /// Unsubscribes from a channel.
    fn unsubscribe(&self, channel: &str);

    /// Invokes an RPC procedure.
    fn invoke(
        &self,
        procedure: &str,
        query: CrudQuery,
    ) -> impl Future<Output = SyncResult<Value>> + Send;

    /// Returns a receiver for transport lifecycle events.
    fn listener(&self) -> broadcast::Receiver<TransportEvent>;
}

/// A scripted transport for unit tests.
///
/// Reads answer from an in-memory value table, writes update it. Subscribe
/// confirmations are never automatic: tests drive them with
/// [`MockTransport::confirm_subscribe`].
pub struct MockTransport {
    state: RwLock<ConnectionState>,
    channels: Mutex<HashMap<String, Channel>>,
    events: broadcast::Sender<TransportEvent>,
    values: Mutex<HashMap<FieldKey, Value>>,
    failures: Mutex<VecDeque<SyncError>>,
    invocations: Mutex<Vec<CrudQuery>>,
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    read_gate: watch::Sender<bool>,
    write_gate: watch::Sender<bool>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (read_gate, _) = watch::channel(true);
        let (write_gate, _) = watch::channel(true);
        Self {
            state: RwLock::new(ConnectionState::Open),
            channels: Mutex::new(HashMap::new()),
            events,
            values: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            read_gate,
            write_gate,
        }
    }

    /// Creates a mock transport that is not connected yet.
    pub fn disconnected() -> Self {
        let transport = Self::new();
        transport.set_state(ConnectionState::Connecting);
        transport
    }

    /// Sets the connection state without emitting events.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Sets the value returned by reads of a field.
    pub fn set_value(&self, key: &FieldKey, value: Value) {
        self.values.lock().insert(key.clone(), value);
    }

    /// Returns the stored value of a field.
    pub fn value(&self, key: &FieldKey) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    /// Makes the next RPC fail with the given error.
    pub fn fail_next(&self, error: SyncError) {
        self.failures.lock().push_back(error);
    }

    /// Holds reads until [`MockTransport::resume_reads`] is called.
    pub fn pause_reads(&self) {
        self.read_gate.send_replace(false);
    }

    /// Releases held reads.
    pub fn resume_reads(&self) {
        self.read_gate.send_replace(true);
    }

    /// Holds updates and deletes until [`MockTransport::resume_writes`] is called.
    pub fn pause_writes(&self) {
        self.write_gate.send_replace(false);
    }

    /// Releases held updates and deletes.
    pub fn resume_writes(&self) {
        self.write_gate.send_replace(true);
    }

    /// Returns every query issued so far.
    pub fn invocations(&self) -> Vec<CrudQuery> {
        self.invocations.lock().clone()
    }

    /// Returns the number of reads issued for a field.
    pub fn read_count(&self, key: &FieldKey) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|q| q.action == CrudAction::Read && q.field_key().as_ref() == Some(key))
            .count()
    }

    /// Returns the number of subscribe calls for a channel.
    pub fn subscribe_count(&self, channel: &str) -> usize {
        self.subscribe_calls
            .lock()
            .iter()
            .filter(|c| c.as_str() == channel)
            .count()
    }

    /// Returns the number of unsubscribe calls for a channel.
    pub fn unsubscribe_count(&self, channel: &str) -> usize {
        self.unsubscribe_calls
            .lock()
            .iter()
            .filter(|c| c.as_str() == channel)
            .count()
    }

    /// Returns a subscribed channel by name.
    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.channels.lock().get(name).cloned()
    }

    /// Confirms a channel subscription.
    pub fn confirm_subscribe(&self, name: &str) {
        if let Some(channel) = self.channel(name) {
            channel.emit(ChannelEvent::Subscribe);
        }
    }

    /// Denies a channel subscription with a raw error payload.
    pub fn deny_subscribe(&self, name: &str, error: Value) {
        if let Some(channel) = self.channel(name) {
            channel.emit(ChannelEvent::SubscribeFail(error));
        }
    }

    /// Publishes a broadcast on a channel.
    pub fn publish(&self, name: &str, message: Option<ChannelMessage>) {
        if let Some(channel) = self.channel(name) {
            channel.publish(message);
        }
    }

    /// Emits a transport lifecycle event, updating the state accordingly.
    pub fn emit(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connect | TransportEvent::Authenticate => {
                self.set_state(ConnectionState::Open)
            }
            TransportEvent::Close => self.set_state(ConnectionState::Closed),
        }
        let _ = self.events.send(event);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn subscribe(&self, channel: &str) -> Channel {
        self.subscribe_calls.lock().push(channel.to_string());
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel, 64))
            .clone()
    }

    fn unsubscribe(&self, channel: &str) {
        self.unsubscribe_calls.lock().push(channel.to_string());
        if let Some(channel) = self.channels.lock().remove(channel) {
            channel.set_state(ChannelState::Unsubscribed);
        }
    }

    async fn invoke(&self, _procedure: &str, query: CrudQuery) -> SyncResult<Value> {
        self.invocations.lock().push(query.clone());

        let mut gate = match query.action {
            CrudAction::Read => self.read_gate.subscribe(),
            CrudAction::Update | CrudAction::Delete => self.write_gate.subscribe(),
        };
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(SyncError::NotConnected);
        }

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let Some(key) = query.field_key() else {
            let mut values = self.values.lock();
            values.retain(|k, _| !k.is_of_resource(&query.resource_type, &query.resource_id));
            return Ok(Value::Null);
        };

        let mut values = self.values.lock();
        match query.action {
            CrudAction::Read => Ok(values.get(&key).cloned().unwrap_or(Value::Null)),
            CrudAction::Update => {
                let value = query.value.unwrap_or(Value::Null);
                values.insert(key, value.clone());
                Ok(value)
            }
            CrudAction::Delete => {
                values.remove(&key);
                Ok(Value::Null)
            }
        }
    }

    fn listener(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
