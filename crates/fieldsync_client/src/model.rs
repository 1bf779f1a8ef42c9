//! Resource-level aggregation of shared fields.
//!
//! A [`Model`] watches several fields of one resource. Fields are obtained
//! from the session registry, so two models on the same session that watch
//! the same field share one [`Field`]. Each model holds one watcher token
//! per owned field; the field is destroyed when its last token is released.

use crate::config::{FieldConfig, ModelConfig};
use crate::error::{SyncError, SyncResult};
use crate::event::{FieldEvent, ModelChange, ModelEvent};
use crate::field::Field;
use crate::registry::WatcherToken;
use crate::session::Session;
use crate::transport::Transport;
use fieldsync_protocol::{
    CrudQuery, FieldKey, FieldTransformation, PublisherId, CRUD_PROCEDURE,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

struct OwnedField<T: Transport> {
    name: String,
    field: Field<T>,
    token: WatcherToken,
    forwarder: JoinHandle<()>,
}

struct ModelState<T: Transport> {
    fields: Vec<OwnedField<T>>,
    value: Map<String, Value>,
    is_active: bool,
    /// Suppresses load detection until every declared field is attached.
    initializing: bool,
    load_emitted: bool,
}

struct ModelInner<T: Transport> {
    session: Session<T>,
    resource_type: String,
    resource_id: String,
    publisher_id: Option<PublisherId>,
    passive_mode: bool,
    field_transformations: HashMap<String, FieldTransformation>,
    state: Mutex<ModelState<T>>,
    events: broadcast::Sender<ModelEvent>,
}

/// A live view of one resource, aggregated from its fields.
///
/// Cloning is cheap; every clone refers to the same model.
pub struct Model<T: Transport> {
    inner: Arc<ModelInner<T>>,
}

impl<T: Transport> Clone for Model<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Model<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("resource_type", &self.inner.resource_type)
            .field("resource_id", &self.inner.resource_id)
            .field("fields", &self.fields())
            .finish()
    }
}

impl<T: Transport> Model<T> {
    /// Creates a model and attaches every declared field.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(session: &Session<T>, config: ModelConfig) -> Self {
        let mut value = config.default_field_values;
        value.insert("id".into(), Value::String(config.resource_id.clone()));

        let publisher_id = config
            .enable_rebound
            .then(|| session.next_publisher_id());
        let (events, _) = broadcast::channel(session.config().event_capacity);

        let model = Self {
            inner: Arc::new(ModelInner {
                session: session.clone(),
                resource_type: config.resource_type,
                resource_id: config.resource_id,
                publisher_id,
                passive_mode: config.passive_mode,
                field_transformations: config.field_transformations,
                state: Mutex::new(ModelState {
                    fields: Vec::new(),
                    value,
                    is_active: true,
                    initializing: true,
                    load_emitted: false,
                }),
                events,
            }),
        };

        for name in config.fields {
            if !model.has_field(&name) {
                model.attach(name);
            }
        }
        model.inner.state.lock().initializing = false;
        model.check_loaded();

        debug!(
            resource_type = %model.inner.resource_type,
            resource_id = %model.inner.resource_id,
            publisher_id = ?model.inner.publisher_id,
            "model created"
        );
        model
    }

    /// Returns the resource type.
    pub fn resource_type(&self) -> &str {
        &self.inner.resource_type
    }

    /// Returns the resource id.
    pub fn resource_id(&self) -> &str {
        &self.inner.resource_id
    }

    /// Returns the publisher id, present when rebound suppression is enabled.
    pub fn publisher_id(&self) -> Option<&PublisherId> {
        self.inner.publisher_id.as_ref()
    }

    /// Returns the owned field names in the order they were added.
    pub fn fields(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .fields
            .iter()
            .map(|owned| owned.name.clone())
            .collect()
    }

    /// Returns true if the model owns the named field.
    pub fn has_field(&self, name: &str) -> bool {
        self.owned_field(name).is_some()
    }

    /// Returns the shared field backing `name`.
    pub fn field(&self, name: &str) -> SyncResult<Field<T>> {
        self.owned_field(name)
            .ok_or_else(|| SyncError::UnknownField(name.to_string()))
    }

    /// Returns a snapshot of the aggregate value, including `id`.
    pub fn value(&self) -> Map<String, Value> {
        self.inner.state.lock().value.clone()
    }

    /// Returns one aggregate entry.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.state.lock().value.get(name).cloned()
    }

    /// Stages a value in the aggregate for a later [`save`](Self::save).
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.inner.state.lock().value.insert(name.into(), value);
    }

    /// Returns true when every owned field has loaded.
    ///
    /// A model without fields counts as loaded but emits no
    /// [`ModelEvent::Load`] until its first added field loads.
    pub fn is_loaded(&self) -> bool {
        self.inner
            .state
            .lock()
            .fields
            .iter()
            .all(|owned| owned.field.is_loaded())
    }

    /// Returns false once the model has been destroyed.
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().is_active
    }

    /// Returns a receiver for this model's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelEvent> {
        self.inner.events.subscribe()
    }

    /// Starts watching another field. Adding an owned field is a no-op.
    pub fn add_field(&self, name: impl Into<String>) -> SyncResult<()> {
        let name = name.into();
        if !self.is_active() {
            return Err(SyncError::Destroyed);
        }
        if self.has_field(&name) {
            return Ok(());
        }
        if !self.attach(name) {
            return Err(SyncError::Destroyed);
        }
        self.check_loaded();
        Ok(())
    }

    /// Writes every aggregate value back into its field and saves them.
    ///
    /// Fields whose value matches their loaded value are not sent. Resolves
    /// with the saved values in field order, or the first error.
    pub async fn save(&self) -> SyncResult<Vec<Value>> {
        let staged: Vec<(Field<T>, Value)> = {
            let state = self.inner.state.lock();
            if !state.is_active {
                return Err(SyncError::Destroyed);
            }
            state
                .fields
                .iter()
                .map(|owned| {
                    let value = state.value.get(&owned.name).cloned().unwrap_or(Value::Null);
                    (owned.field.clone(), value)
                })
                .collect()
        };

        let mut saves = JoinSet::new();
        for (index, (field, value)) in staged.into_iter().enumerate() {
            field.stage(value);
            saves.spawn(async move { (index, field.save().await) });
        }

        let mut saved = Vec::with_capacity(saves.len());
        let mut first_error = None;
        while let Some(joined) = saves.join_next().await {
            match joined {
                Ok((index, Ok(value))) => saved.push((index, value)),
                Ok((_, Err(error))) => {
                    first_error.get_or_insert(error);
                }
                Err(join_error) => {
                    first_error.get_or_insert(SyncError::transport_fatal(join_error.to_string()));
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        saved.sort_by_key(|(index, _)| *index);
        Ok(saved.into_iter().map(|(_, value)| value).collect())
    }

    /// Writes one field of the resource.
    ///
    /// Owned fields update optimistically; other fields are written with a
    /// plain RPC.
    pub async fn update(&self, name: &str, value: Value) -> SyncResult<Value> {
        if let Some(field) = self.owned_field(name) {
            return field.update(value).await;
        }
        let key = FieldKey::new(&self.inner.resource_type, &self.inner.resource_id, name);
        let query = CrudQuery::update(&key, value, self.inner.publisher_id.clone());
        self.invoke(query).await
    }

    /// Deletes one field of the resource, or the whole resource when `name`
    /// is `None`.
    pub async fn delete(&self, name: Option<&str>) -> SyncResult<Value> {
        let query = match name {
            None => CrudQuery::delete_resource(
                &self.inner.resource_type,
                &self.inner.resource_id,
                self.inner.publisher_id.clone(),
            ),
            Some(name) => {
                if let Some(field) = self.owned_field(name) {
                    return field.delete().await;
                }
                let key = FieldKey::new(&self.inner.resource_type, &self.inner.resource_id, name);
                CrudQuery::delete_field(&key, self.inner.publisher_id.clone())
            }
        };
        self.invoke(query).await
    }

    /// Stops the model and releases its fields. Idempotent.
    ///
    /// Field events already in flight are dropped. A shared field stays alive
    /// while another model still watches it.
    pub fn destroy(&self) {
        let owned = {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                return;
            }
            state.is_active = false;
            std::mem::take(&mut state.fields)
        };

        let registry = self.inner.session.fields();
        for owned in owned {
            owned.forwarder.abort();
            if let Some(field) = registry.release(owned.field.key(), owned.token) {
                field.destroy();
            }
        }
        debug!(
            resource_type = %self.inner.resource_type,
            resource_id = %self.inner.resource_id,
            "model destroyed"
        );
    }

    fn owned_field(&self, name: &str) -> Option<Field<T>> {
        self.inner
            .state
            .lock()
            .fields
            .iter()
            .find(|owned| owned.name == name)
            .map(|owned| owned.field.clone())
    }

    async fn invoke(&self, query: CrudQuery) -> SyncResult<Value> {
        if !self.is_active() {
            return Err(SyncError::Destroyed);
        }
        let result = self
            .inner
            .session
            .transport()
            .invoke(CRUD_PROCEDURE, query)
            .await;
        if let Err(error) = &result {
            warn!(resource_id = %self.inner.resource_id, %error, "resource write failed");
        }
        result
    }

    /// Obtains the shared field and wires it into this model.
    ///
    /// Returns false if the model was destroyed meanwhile.
    fn attach(&self, name: String) -> bool {
        let session = &self.inner.session;
        let key = FieldKey::new(&self.inner.resource_type, &self.inner.resource_id, &name);

        let (field, token) = session.fields().acquire(key.clone(), || {
            let mut config = FieldConfig::for_key(key.clone())
                .with_passive_mode(self.inner.passive_mode)
                .with_publisher_id(self.inner.publisher_id.clone());
            if let Some(transformation) = self.inner.field_transformations.get(&name) {
                config = config.with_transformation(transformation.clone());
            }
            Field::new(session, config)
        });
        debug!(field = %key, watchers = session.watcher_count(&key), "field attached");

        let events = field.subscribe();

        let mut state = self.inner.state.lock();
        if !state.is_active {
            drop(state);
            if let Some(field) = session.fields().release(&key, token) {
                field.destroy();
            }
            return false;
        }

        // Read under the model lock: the forwarder cannot apply a newer
        // change until the mirrored value is in place.
        let current = field.value();
        if field.is_loaded() || !current.is_null() {
            state.value.insert(name.clone(), current);
        } else {
            state.value.entry(name.clone()).or_insert(Value::Null);
        }

        let forwarder = tokio::spawn(forward(
            Arc::downgrade(&self.inner),
            name.clone(),
            events,
        ));
        state.fields.push(OwnedField {
            name,
            field,
            token,
            forwarder,
        });
        true
    }

    fn handle_field_event(&self, name: &str, event: FieldEvent) {
        match event {
            FieldEvent::Change(change) => {
                {
                    let mut state = self.inner.state.lock();
                    if !state.is_active {
                        return;
                    }
                    state.value.insert(name.to_string(), change.new_value.clone());
                }
                self.emit(ModelEvent::Change(ModelChange {
                    resource_type: self.inner.resource_type.clone(),
                    resource_id: self.inner.resource_id.clone(),
                    resource_field: change.field,
                    old_value: change.old_value,
                    new_value: change.new_value,
                    is_remote: change.is_remote,
                }));
            }
            FieldEvent::Error(error) => {
                if self.is_active() {
                    self.emit(ModelEvent::Error(error));
                }
            }
            FieldEvent::Load => self.resync_field(name),
        }
    }

    /// Copies a field's current value into the aggregate.
    ///
    /// Runs on first load, where a `null` load emits no change but still
    /// replaces a declared default, and after the event stream lagged.
    fn resync_field(&self, name: &str) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_active {
                return;
            }
            let Some(value) = state
                .fields
                .iter()
                .find(|owned| owned.name == name)
                .map(|owned| owned.field.value())
            else {
                return;
            };
            state.value.insert(name.to_string(), value);
        }
        self.check_loaded();
    }

    fn check_loaded(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.is_active
                || state.initializing
                || state.load_emitted
                || state.fields.is_empty()
            {
                return;
            }
            if !state.fields.iter().all(|owned| owned.field.is_loaded()) {
                return;
            }
            state.load_emitted = true;
        }
        debug!(resource_id = %self.inner.resource_id, "model loaded");
        self.emit(ModelEvent::Load);
    }

    fn emit(&self, event: ModelEvent) {
        let _ = self.inner.events.send(event);
    }
}

async fn forward<T: Transport>(
    weak: Weak<ModelInner<T>>,
    name: String,
    mut events: broadcast::Receiver<FieldEvent>,
) {
    loop {
        let received = events.recv().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let model = Model { inner };
        if !model.is_active() {
            break;
        }
        match received {
            Ok(event) => model.handle_field_event(&name, event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(field = %name, skipped, "missed field events, resyncing");
                model.resync_field(&name);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
