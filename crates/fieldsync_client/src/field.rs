//! Synchronization of a single resource field.
//!
//! A [`Field`] mirrors one `type/id/name` value. It subscribes to the
//! field channel, loads the value over RPC, applies or re-fetches remote
//! broadcasts and performs optimistic local writes.
//!
//! ## Event intake
//!
//! One dispatcher task per field drains the channel broadcasts, the channel
//! subscribe/subscribe-fail events and the transport lifecycle events.
//! Reads it triggers are spawned, so an RPC in flight never blocks intake.
//!
//! ## Key Invariants
//!
//! - `is_loaded` goes false → true once and never reverts
//! - `loaded_value` is the last value confirmed by the server
//! - `value` may run ahead of `loaded_value` while a write is in flight
//! - nothing mutates a field after [`Field::destroy`]

use crate::config::FieldConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::{FieldChange, FieldEvent};
use crate::registry::WatcherToken;
use crate::session::Session;
use crate::transport::{Channel, ChannelEvent, Transport, TransportEvent};
use fieldsync_protocol::{
    ChannelMessage, CrudQuery, FieldKey, FieldTransformation, PublisherId, CRUD_PROCEDURE,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct FieldState {
    value: Value,
    loaded_value: Value,
    is_loaded: bool,
    pending_updates: u32,
    pending_deletes: u32,
    is_active: bool,
    /// Set by the fast init load; swallows the next subscribe confirmation.
    skip_next_subscribe: bool,
}

impl FieldState {
    fn has_pending_write(&self) -> bool {
        self.pending_updates > 0 || self.pending_deletes > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Update,
    Delete,
}

/// Keeps a pending-write counter raised until the RPC settles or the
/// caller drops the future.
struct PendingWrite<'a> {
    state: &'a Mutex<FieldState>,
    kind: WriteKind,
}

impl<'a> PendingWrite<'a> {
    fn begin(state: &'a Mutex<FieldState>, kind: WriteKind) -> Self {
        Self { state, kind }
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        match self.kind {
            WriteKind::Update => state.pending_updates = state.pending_updates.saturating_sub(1),
            WriteKind::Delete => state.pending_deletes = state.pending_deletes.saturating_sub(1),
        }
    }
}

struct FieldInner<T: Transport> {
    session: Session<T>,
    key: FieldKey,
    channel: Channel,
    transformation: Option<FieldTransformation>,
    passive_mode: bool,
    publisher_id: Option<PublisherId>,
    watcher: WatcherToken,
    state: Mutex<FieldState>,
    events: broadcast::Sender<FieldEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// A live, synchronized field of a remote resource.
///
/// Cloning is cheap; every clone refers to the same field.
pub struct Field<T: Transport> {
    inner: Arc<FieldInner<T>>,
}

impl<T: Transport> Clone for Field<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("key", &self.inner.key)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

enum Input {
    Message(Result<Option<ChannelMessage>, RecvError>),
    Channel(Result<ChannelEvent, RecvError>),
    Transport(Result<TransportEvent, RecvError>),
}

impl<T: Transport> Field<T> {
    /// Creates a field and starts synchronizing it.
    ///
    /// Subscribes to the field channel and registers as one of its watchers.
    /// If the transport is already connected the value is loaded right away
    /// and the next subscribe confirmation is skipped; otherwise the first
    /// load waits for the subscribe confirmation.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(session: &Session<T>, config: FieldConfig) -> Self {
        let channel_name = config.key.channel_name();
        let transport = session.transport();

        let ((), watcher) = session
            .channel_watchers()
            .acquire(channel_name.clone(), || ());
        let channel = transport.subscribe(&channel_name);

        let messages = channel.messages();
        let channel_events = channel.listener();
        let transport_events = transport.listener();

        let fast_init_load = transport.is_connected();
        let (events, _) = broadcast::channel(session.config().event_capacity);

        let inner = Arc::new(FieldInner {
            session: session.clone(),
            key: config.key,
            channel,
            transformation: config.transformation,
            passive_mode: config.passive_mode,
            publisher_id: config.publisher_id,
            watcher,
            state: Mutex::new(FieldState {
                value: Value::Null,
                loaded_value: Value::Null,
                is_loaded: false,
                pending_updates: 0,
                pending_deletes: 0,
                is_active: true,
                skip_next_subscribe: fast_init_load,
            }),
            events,
            dispatcher: Mutex::new(None),
        });

        let dispatcher = tokio::spawn(dispatch(
            Arc::downgrade(&inner),
            messages,
            channel_events,
            transport_events,
        ));
        *inner.dispatcher.lock() = Some(dispatcher);

        let field = Self { inner };
        debug!(
            channel = %field.channel_name(),
            watcher = %watcher,
            fast_init_load,
            "field created"
        );
        if fast_init_load {
            field.spawn_load();
        }
        field
    }

    /// Returns the field identity.
    pub fn key(&self) -> &FieldKey {
        &self.inner.key
    }

    /// Returns the field name.
    pub fn name(&self) -> &str {
        &self.inner.key.name
    }

    /// Returns the channel this field listens on.
    pub fn channel_name(&self) -> &str {
        self.inner.channel.name()
    }

    /// Returns the session this field belongs to.
    pub fn session(&self) -> &Session<T> {
        &self.inner.session
    }

    /// Returns the current local value.
    pub fn value(&self) -> Value {
        self.inner.state.lock().value.clone()
    }

    /// Returns the last value confirmed by the server.
    pub fn loaded_value(&self) -> Value {
        self.inner.state.lock().loaded_value.clone()
    }

    /// Returns true once the field has loaded.
    pub fn is_loaded(&self) -> bool {
        self.inner.state.lock().is_loaded
    }

    /// Returns true while an update is in flight.
    pub fn is_updating(&self) -> bool {
        self.inner.state.lock().pending_updates > 0
    }

    /// Returns true while a delete is in flight.
    pub fn is_deleting(&self) -> bool {
        self.inner.state.lock().pending_deletes > 0
    }

    /// Returns false once the field has been destroyed.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().is_active
    }

    /// Returns true if pushed values are applied without re-fetching.
    pub fn is_passive(&self) -> bool {
        self.inner.passive_mode
    }

    /// Returns the publisher id used for echo suppression.
    pub fn publisher_id(&self) -> Option<&PublisherId> {
        self.inner.publisher_id.as_ref()
    }

    /// Returns the read-side transformation.
    pub fn transformation(&self) -> Option<&FieldTransformation> {
        self.inner.transformation.as_ref()
    }

    /// Returns a receiver for this field's events.
    pub fn subscribe(&self) -> broadcast::Receiver<FieldEvent> {
        self.inner.events.subscribe()
    }

    /// Sets the local value without emitting a change or issuing an RPC.
    ///
    /// A later [`save`](Self::save) sends it if it differs from the loaded value.
    pub fn stage(&self, value: Value) {
        self.inner.state.lock().value = value;
    }

    /// Reads the value from the server.
    ///
    /// The result replaces the local value unless a write is in flight, in
    /// which case it is discarded. The first completed read emits
    /// [`FieldEvent::Load`] either way. Failures are reported as
    /// [`FieldEvent::Error`] and leave the state untouched.
    pub async fn load_data(&self) {
        if !self.is_active() {
            return;
        }

        let query = CrudQuery::read(&self.inner.key, self.inner.transformation.as_ref());
        debug!(field = %self.inner.key, "loading field");

        let fetched = match self
            .inner
            .session
            .transport()
            .invoke(CRUD_PROCEDURE, query)
            .await
        {
            Ok(fetched) => fetched,
            Err(error) => {
                if self.is_active() {
                    warn!(field = %self.inner.key, %error, "field read failed");
                    self.emit(FieldEvent::Error(error));
                }
                return;
            }
        };

        let (old_value, first_load) = {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                return;
            }
            let first_load = !std::mem::replace(&mut state.is_loaded, true);
            if state.has_pending_write() {
                debug!(field = %self.inner.key, "discarding read while a write is in flight");
                (None, first_load)
            } else {
                state.loaded_value = fetched.clone();
                (
                    Some(std::mem::replace(&mut state.value, fetched.clone())),
                    first_load,
                )
            }
        };

        if let Some(old_value) = old_value {
            self.emit_change(old_value, fetched, true);
        }
        if first_load {
            self.emit(FieldEvent::Load);
        }
    }

    /// Writes a new value.
    ///
    /// The local value changes immediately. On failure it is not rolled
    /// back; the error is returned to the caller.
    pub async fn update(&self, value: Value) -> SyncResult<Value> {
        self.write(WriteKind::Update, value).await
    }

    /// Deletes the field value.
    ///
    /// The local value becomes `null` immediately. On failure it is not
    /// rolled back; the error is returned to the caller.
    pub async fn delete(&self) -> SyncResult<Value> {
        self.write(WriteKind::Delete, Value::Null).await
    }

    /// Sends the local value if it differs from the loaded value.
    pub async fn save(&self) -> SyncResult<Value> {
        let value = {
            let state = self.inner.state.lock();
            if state.value == state.loaded_value {
                return Ok(state.value.clone());
            }
            state.value.clone()
        };
        self.update(value).await
    }

    /// Stops synchronizing this field. Idempotent.
    ///
    /// The channel is unsubscribed only when no other field on this session
    /// still watches it.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                return;
            }
            state.is_active = false;
            state.skip_next_subscribe = false;
        }

        if let Some(dispatcher) = self.inner.dispatcher.lock().take() {
            dispatcher.abort();
        }

        let session = &self.inner.session;
        let channel_name = self.channel_name().to_string();
        let last_watcher = session
            .channel_watchers()
            .release(&channel_name, self.inner.watcher)
            .is_some();

        debug!(channel = %channel_name, last_watcher, "field destroyed");
        if last_watcher {
            session.transport().unsubscribe(&channel_name);
        }
    }

    async fn write(&self, kind: WriteKind, value: Value) -> SyncResult<Value> {
        let old_value = {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                return Err(SyncError::Destroyed);
            }
            match kind {
                WriteKind::Update => state.pending_updates += 1,
                WriteKind::Delete => state.pending_deletes += 1,
            }
            std::mem::replace(&mut state.value, value.clone())
        };
        let _pending = PendingWrite::begin(&self.inner.state, kind);

        self.emit_change(old_value, value.clone(), false);

        let publisher_id = self.inner.publisher_id.clone();
        let query = match kind {
            WriteKind::Update => CrudQuery::update(&self.inner.key, value, publisher_id),
            WriteKind::Delete => CrudQuery::delete_field(&self.inner.key, publisher_id),
        };
        debug!(field = %self.inner.key, action = ?query.action, "writing field");

        let result = self
            .inner
            .session
            .transport()
            .invoke(CRUD_PROCEDURE, query)
            .await;
        if let Err(error) = &result {
            warn!(field = %self.inner.key, %error, "field write failed");
        }
        result
    }

    fn spawn_load(&self) {
        let field = self.clone();
        tokio::spawn(async move { field.load_data().await });
    }

    fn handle_message(&self, message: Option<ChannelMessage>) {
        let Some(message) = message else {
            debug!(channel = %self.channel_name(), "refresh requested");
            self.spawn_load();
            return;
        };

        if message.is_from(self.publisher_id()) {
            debug!(channel = %self.channel_name(), "ignoring own broadcast");
            return;
        }

        if message.is_delete() {
            self.apply_remote(Value::Null);
        } else if self.inner.passive_mode {
            self.apply_remote(message.value.unwrap_or(Value::Null));
        } else {
            self.spawn_load();
        }
    }

    fn apply_remote(&self, value: Value) {
        let (old_value, first_load) = {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                return;
            }
            state.loaded_value = value.clone();
            let old_value = std::mem::replace(&mut state.value, value.clone());
            (old_value, !std::mem::replace(&mut state.is_loaded, true))
        };

        self.emit_change(old_value, value, true);
        if first_load {
            self.emit(FieldEvent::Load);
        }
    }

    fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Subscribe => {
                let skip = std::mem::take(&mut self.inner.state.lock().skip_next_subscribe);
                debug!(channel = %self.channel_name(), skip, "subscribed");
                if !skip {
                    self.spawn_load();
                }
            }
            ChannelEvent::SubscribeFail(raw) => {
                self.inner.state.lock().skip_next_subscribe = false;
                let error = SyncError::SubscribeFailed {
                    channel: self.channel_name().to_string(),
                    error: Box::new(SyncError::from_raw(&raw)),
                };
                warn!(%error, "subscription failed");
                self.emit(FieldEvent::Error(error));
            }
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Close => {
                self.inner.state.lock().skip_next_subscribe = false;
            }
            TransportEvent::Authenticate => {
                debug!(channel = %self.channel_name(), "resubscribing after authentication");
                self.inner.session.transport().subscribe(self.channel_name());
            }
            TransportEvent::Connect => {}
        }
    }

    fn emit_change(&self, old_value: Value, new_value: Value, is_remote: bool) {
        if old_value == new_value {
            return;
        }
        self.emit(FieldEvent::Change(FieldChange {
            field: self.inner.key.name.clone(),
            old_value,
            new_value,
            is_remote,
        }));
    }

    fn emit(&self, event: FieldEvent) {
        let _ = self.inner.events.send(event);
    }
}

async fn dispatch<T: Transport>(
    weak: Weak<FieldInner<T>>,
    mut messages: broadcast::Receiver<Option<ChannelMessage>>,
    mut channel_events: broadcast::Receiver<ChannelEvent>,
    mut transport_events: broadcast::Receiver<TransportEvent>,
) {
    let (mut messages_open, mut channel_open, mut transport_open) = (true, true, true);

    while messages_open || channel_open || transport_open {
        let input = tokio::select! {
            message = messages.recv(), if messages_open => Input::Message(message),
            event = channel_events.recv(), if channel_open => Input::Channel(event),
            event = transport_events.recv(), if transport_open => Input::Transport(event),
        };

        let Some(inner) = weak.upgrade() else {
            break;
        };
        let field = Field { inner };
        if !field.is_active() {
            break;
        }

        match input {
            Input::Message(Ok(message)) => field.handle_message(message),
            Input::Channel(Ok(event)) => field.handle_channel_event(event),
            Input::Transport(Ok(event)) => field.handle_transport_event(event),
            Input::Message(Err(RecvError::Lagged(skipped))) => {
                warn!(channel = %field.channel_name(), skipped, "missed broadcasts, reloading");
                field.spawn_load();
            }
            Input::Channel(Err(RecvError::Lagged(skipped)))
            | Input::Transport(Err(RecvError::Lagged(skipped))) => {
                warn!(channel = %field.channel_name(), skipped, "missed lifecycle events");
            }
            Input::Message(Err(RecvError::Closed)) => messages_open = false,
            Input::Channel(Err(RecvError::Closed)) => channel_open = false,
            Input::Transport(Err(RecvError::Closed)) => transport_open = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionState, MockTransport};
    use serde_json::json;
    use std::time::Duration;

    fn key() -> FieldKey {
        FieldKey::new("Product", "1", "price")
    }

    fn setup(transport: MockTransport) -> (Arc<MockTransport>, Session<MockTransport>) {
        let transport = Arc::new(transport);
        let session = Session::new(Arc::clone(&transport));
        (transport, session)
    }

    fn field(session: &Session<MockTransport>) -> Field<MockTransport> {
        Field::new(session, FieldConfig::for_key(key()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<FieldEvent>) -> Vec<FieldEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn changes(events: &[FieldEvent]) -> Vec<&FieldChange> {
        events
            .iter()
            .filter_map(|e| match e {
                FieldEvent::Change(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    fn load_count(events: &[FieldEvent]) -> usize {
        events.iter().filter(|e| **e == FieldEvent::Load).count()
    }

    #[tokio::test]
    async fn fast_init_load_skips_first_subscribe() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(10));

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;

        assert_eq!(field.value(), json!(10));
        assert_eq!(field.loaded_value(), json!(10));
        assert!(field.is_loaded());
        assert_eq!(transport.read_count(&key()), 1);

        transport.confirm_subscribe(field.channel_name());
        settle().await;
        assert_eq!(transport.read_count(&key()), 1);

        transport.confirm_subscribe(field.channel_name());
        settle().await;
        assert_eq!(transport.read_count(&key()), 2);

        let events = drain(&mut rx);
        assert_eq!(load_count(&events), 1);
        let changes = changes(&events);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old_value, Value::Null);
        assert_eq!(changes[0].new_value, json!(10));
        assert!(changes[0].is_remote);
    }

    #[tokio::test]
    async fn deferred_load_waits_for_subscribe() {
        let (transport, session) = setup(MockTransport::disconnected());
        transport.set_value(&key(), json!("a"));

        let field = field(&session);
        settle().await;
        assert_eq!(transport.read_count(&key()), 0);
        assert!(!field.is_loaded());

        transport.emit(TransportEvent::Connect);
        transport.confirm_subscribe(field.channel_name());
        settle().await;

        assert_eq!(transport.read_count(&key()), 1);
        assert!(field.is_loaded());
        assert_eq!(field.value(), json!("a"));
    }

    #[tokio::test]
    async fn load_event_fires_once() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(1));

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;

        transport.set_value(&key(), json!(2));
        transport.publish(field.channel_name(), None);
        settle().await;
        field.load_data().await;

        let events = drain(&mut rx);
        assert_eq!(load_count(&events), 1);
        assert_eq!(changes(&events).len(), 2);
        assert_eq!(field.value(), json!(2));
    }

    #[tokio::test]
    async fn active_mode_refetches_pushed_values() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(7));

        let field = field(&session);
        settle().await;

        transport.set_value(&key(), json!(9));
        transport.publish(
            field.channel_name(),
            Some(ChannelMessage::update(json!(5), None)),
        );
        settle().await;

        assert_eq!(transport.read_count(&key()), 2);
        assert_eq!(field.value(), json!(9));
        assert_eq!(field.loaded_value(), json!(9));
    }

    #[tokio::test]
    async fn active_mode_applies_deletes_directly() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(7));

        let field = field(&session);
        settle().await;

        transport.publish(field.channel_name(), Some(ChannelMessage::delete(None)));
        settle().await;

        assert_eq!(transport.read_count(&key()), 1);
        assert_eq!(field.value(), Value::Null);
        assert_eq!(field.loaded_value(), Value::Null);
    }

    #[tokio::test]
    async fn passive_mode_applies_pushes() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(3));

        let field = Field::new(&session, FieldConfig::for_key(key()).with_passive_mode(true));
        let mut rx = field.subscribe();
        settle().await;
        drain(&mut rx);

        transport.publish(
            field.channel_name(),
            Some(ChannelMessage::update(json!(4), None)),
        );
        settle().await;
        assert_eq!(field.value(), json!(4));
        assert_eq!(field.loaded_value(), json!(4));

        transport.publish(field.channel_name(), Some(ChannelMessage::delete(None)));
        settle().await;
        assert_eq!(field.value(), Value::Null);
        assert_eq!(field.loaded_value(), Value::Null);

        let events = drain(&mut rx);
        let changes = changes(&events);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.is_remote));
        assert_eq!(changes[1].old_value, json!(4));
        assert_eq!(changes[1].new_value, Value::Null);
        assert_eq!(transport.read_count(&key()), 1);
    }

    #[tokio::test]
    async fn passive_push_counts_as_load() {
        let (transport, session) = setup(MockTransport::disconnected());
        let field = Field::new(&session, FieldConfig::for_key(key()).with_passive_mode(true));
        let mut rx = field.subscribe();

        transport.publish(
            field.channel_name(),
            Some(ChannelMessage::update(json!("x"), None)),
        );
        settle().await;

        assert!(field.is_loaded());
        assert_eq!(load_count(&drain(&mut rx)), 1);
    }

    #[tokio::test]
    async fn refresh_message_always_reloads() {
        let (transport, session) = setup(MockTransport::new());
        let field = Field::new(&session, FieldConfig::for_key(key()).with_passive_mode(true));
        settle().await;

        transport.set_value(&key(), json!(11));
        transport.publish(field.channel_name(), None);
        settle().await;

        assert_eq!(transport.read_count(&key()), 2);
        assert_eq!(field.value(), json!(11));
    }

    #[tokio::test]
    async fn own_broadcasts_are_ignored() {
        let (transport, session) = setup(MockTransport::new());
        let own = session.next_publisher_id();
        let field = Field::new(
            &session,
            FieldConfig::for_key(key())
                .with_passive_mode(true)
                .with_publisher_id(Some(own.clone())),
        );
        let mut rx = field.subscribe();
        settle().await;
        drain(&mut rx);

        transport.publish(
            field.channel_name(),
            Some(ChannelMessage::update(json!(1), Some(own.clone()))),
        );
        transport.publish(field.channel_name(), Some(ChannelMessage::delete(Some(own))));
        settle().await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(transport.read_count(&key()), 1);

        transport.publish(
            field.channel_name(),
            Some(ChannelMessage::update(json!(2), Some(session.next_publisher_id()))),
        );
        settle().await;
        assert_eq!(field.value(), json!(2));
    }

    #[tokio::test]
    async fn no_change_when_value_is_equal() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!({"amount": 5}));

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;
        drain(&mut rx);

        transport.publish(field.channel_name(), None);
        settle().await;
        field.update(json!({"amount": 5})).await.unwrap();

        assert_eq!(transport.read_count(&key()), 2);
        assert!(changes(&drain(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn update_is_optimistic() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(1));

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;
        drain(&mut rx);

        transport.pause_writes();
        let task = tokio::spawn({
            let field = field.clone();
            async move { field.update(json!(2)).await }
        });
        settle().await;

        assert!(field.is_updating());
        assert!(!field.is_deleting());
        assert_eq!(field.value(), json!(2));
        assert_eq!(field.loaded_value(), json!(1));

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![FieldEvent::Change(FieldChange {
                field: "price".into(),
                old_value: json!(1),
                new_value: json!(2),
                is_remote: false,
            })]
        );

        transport.resume_writes();
        assert_eq!(task.await.unwrap().unwrap(), json!(2));
        assert!(!field.is_updating());
        assert_eq!(transport.value(&key()), Some(json!(2)));

        let update = transport.invocations().pop().unwrap();
        assert_eq!(update.value, Some(json!(2)));
        assert_eq!(update.publisher_id, None);
    }

    #[tokio::test]
    async fn failed_update_keeps_optimistic_value() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(1));

        let field = field(&session);
        settle().await;

        transport.fail_next(SyncError::transport_fatal("rejected"));
        let result = field.update(json!(5)).await;

        assert_eq!(result, Err(SyncError::transport_fatal("rejected")));
        assert!(!field.is_updating());
        assert_eq!(field.value(), json!(5));
        assert_eq!(field.loaded_value(), json!(1));
    }

    #[tokio::test]
    async fn delete_is_optimistic() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!("keep"));

        let field = field(&session);
        settle().await;

        transport.pause_writes();
        let task = tokio::spawn({
            let field = field.clone();
            async move { field.delete().await }
        });
        settle().await;

        assert!(field.is_deleting());
        assert!(!field.is_updating());
        assert_eq!(field.value(), Value::Null);

        transport.resume_writes();
        task.await.unwrap().unwrap();
        assert!(!field.is_deleting());
        assert_eq!(transport.value(&key()), None);
    }

    #[tokio::test]
    async fn dropped_write_clears_pending_flag() {
        let (transport, session) = setup(MockTransport::new());
        let field = field(&session);
        settle().await;

        transport.pause_writes();
        let attempt = tokio::time::timeout(Duration::from_millis(20), field.update(json!(1))).await;
        assert!(attempt.is_err());
        assert!(!field.is_updating());
        transport.resume_writes();
    }

    #[tokio::test]
    async fn read_is_discarded_while_writing() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(1));

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;
        drain(&mut rx);

        transport.pause_writes();
        let task = tokio::spawn({
            let field = field.clone();
            async move { field.update(json!(2)).await }
        });
        settle().await;

        transport.set_value(&key(), json!(99));
        field.load_data().await;

        assert_eq!(field.value(), json!(2));
        assert_eq!(field.loaded_value(), json!(1));
        assert_eq!(changes(&drain(&mut rx)).len(), 1);

        transport.resume_writes();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn save_only_sends_changes() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(1));

        let field = field(&session);
        settle().await;

        assert_eq!(field.save().await.unwrap(), json!(1));
        assert_eq!(transport.invocations().len(), 1);

        field.stage(json!(3));
        field.save().await.unwrap();
        assert_eq!(transport.invocations().len(), 2);
        assert_eq!(transport.value(&key()), Some(json!(3)));
    }

    #[tokio::test]
    async fn read_failure_emits_error() {
        let (transport, session) = setup(MockTransport::new());
        transport.fail_next(SyncError::Remote {
            message: "no access".into(),
            name: Some("ForbiddenError".into()),
        });

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;

        let events = drain(&mut rx);
        assert!(matches!(&events[..], [FieldEvent::Error(SyncError::Remote { .. })]));
        assert!(!field.is_loaded());
        assert_eq!(field.value(), Value::Null);
    }

    #[tokio::test]
    async fn subscribe_failure_disarms_fast_init_load() {
        let (transport, session) = setup(MockTransport::new());
        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;
        assert_eq!(transport.read_count(&key()), 1);
        drain(&mut rx);

        transport.deny_subscribe(
            field.channel_name(),
            json!({"name": "AuthError", "message": "denied"}),
        );
        settle().await;

        let events = drain(&mut rx);
        let [FieldEvent::Error(SyncError::SubscribeFailed { channel, error })] = &events[..] else {
            panic!("unexpected events: {events:?}");
        };
        assert_eq!(channel, "crud>Product/1/price");
        assert_eq!(error.to_string(), "AuthError: denied");

        transport.confirm_subscribe(field.channel_name());
        settle().await;
        assert_eq!(transport.read_count(&key()), 2);
    }

    #[tokio::test]
    async fn close_rearms_subscribe_load() {
        let (transport, session) = setup(MockTransport::new());
        let field = field(&session);
        settle().await;

        transport.confirm_subscribe(field.channel_name());
        settle().await;
        assert_eq!(transport.read_count(&key()), 1);

        transport.emit(TransportEvent::Close);
        settle().await;
        transport.emit(TransportEvent::Connect);
        transport.confirm_subscribe(field.channel_name());
        settle().await;

        assert_eq!(transport.read_count(&key()), 2);
        assert_eq!(transport.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn authenticate_resubscribes() {
        let (transport, session) = setup(MockTransport::new());
        let field = field(&session);
        settle().await;

        transport.emit(TransportEvent::Authenticate);
        settle().await;

        assert_eq!(transport.subscribe_count(field.channel_name()), 2);
    }

    #[tokio::test]
    async fn read_carries_transformation() {
        let (transport, session) = setup(MockTransport::new());
        let _field = Field::new(
            &session,
            FieldConfig::for_key(key()).with_transformation(FieldTransformation::slice_to(3)),
        );
        settle().await;

        assert_eq!(transport.invocations()[0].slice_to, Some(3));
    }

    #[tokio::test]
    async fn destroy_during_update() {
        let (transport, session) = setup(MockTransport::new());
        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;
        drain(&mut rx);

        transport.pause_writes();
        let task = tokio::spawn({
            let field = field.clone();
            async move { field.update(json!("x")).await }
        });
        settle().await;

        field.destroy();
        assert!(!field.is_active());
        assert_eq!(transport.unsubscribe_count(field.channel_name()), 1);

        transport.resume_writes();
        assert_eq!(task.await.unwrap().unwrap(), json!("x"));
        assert!(!field.is_updating());

        field.load_data().await;
        settle().await;
        assert!(!field.is_active());
        assert_eq!(changes(&drain(&mut rx)).len(), 1);
        assert_eq!(field.update(json!("y")).await, Err(SyncError::Destroyed));
    }

    #[tokio::test]
    async fn read_in_flight_at_destroy_is_dropped() {
        let (transport, session) = setup(MockTransport::new());
        transport.set_value(&key(), json!(5));
        transport.pause_reads();

        let field = field(&session);
        let mut rx = field.subscribe();
        settle().await;

        field.destroy();
        transport.resume_reads();
        settle().await;

        assert_eq!(field.value(), Value::Null);
        assert!(!field.is_loaded());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn channel_is_reference_counted() {
        let (transport, session) = setup(MockTransport::new());
        let a = field(&session);
        let b = field(&session);
        let channel = a.channel_name().to_string();
        assert_eq!(session.channel_watcher_count(&channel), 2);

        a.destroy();
        a.destroy();
        assert_eq!(transport.unsubscribe_count(&channel), 0);
        assert!(b.is_active());
        assert_eq!(session.channel_watcher_count(&channel), 1);

        b.destroy();
        assert_eq!(transport.unsubscribe_count(&channel), 1);
        assert_eq!(session.channel_watcher_count(&channel), 0);
    }
}
