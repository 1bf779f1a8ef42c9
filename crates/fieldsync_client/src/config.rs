//! Configuration for sessions, fields and models.

use fieldsync_protocol::{FieldKey, FieldTransformation, PublisherId};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Configuration for a transport session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Buffer size of every field and model event channel.
    pub event_capacity: usize,
}

impl SessionConfig {
    /// Creates a new session configuration.
    pub fn new() -> Self {
        Self {
            event_capacity: 256,
        }
    }

    /// Sets the event channel buffer size.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a single field.
#[derive(Debug, Clone)]
pub struct FieldConfig {
    /// Field identity.
    pub key: FieldKey,
    /// Read-side transformation.
    pub transformation: Option<FieldTransformation>,
    /// Trust pushed values instead of re-fetching.
    pub passive_mode: bool,
    /// Publisher id used for echo suppression.
    pub publisher_id: Option<PublisherId>,
}

impl FieldConfig {
    /// Creates a new field configuration.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::for_key(FieldKey::new(resource_type, resource_id, name))
    }

    /// Creates a field configuration for an existing key.
    pub fn for_key(key: FieldKey) -> Self {
        Self {
            key,
            transformation: None,
            passive_mode: false,
            publisher_id: None,
        }
    }

    /// Sets the read-side transformation.
    pub fn with_transformation(mut self, transformation: FieldTransformation) -> Self {
        self.transformation = Some(transformation);
        self
    }

    /// Enables or disables passive mode.
    pub fn with_passive_mode(mut self, passive: bool) -> Self {
        self.passive_mode = passive;
        self
    }

    /// Sets the publisher id.
    pub fn with_publisher_id(mut self, publisher_id: Option<PublisherId>) -> Self {
        self.publisher_id = publisher_id;
        self
    }
}

/// Configuration for a model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Resource type.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: String,
    /// Fields to watch, in order.
    pub fields: Vec<String>,
    /// Per-field read transformations.
    pub field_transformations: HashMap<String, FieldTransformation>,
    /// Values the aggregate starts with before fields load.
    pub default_field_values: Map<String, Value>,
    /// Assign a publisher id so the model ignores its own broadcasts.
    pub enable_rebound: bool,
    /// Trust pushed values instead of re-fetching.
    pub passive_mode: bool,
}

impl ModelConfig {
    /// Creates a new model configuration.
    pub fn new(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            fields: Vec::new(),
            field_transformations: HashMap::new(),
            default_field_values: Map::new(),
            enable_rebound: false,
            passive_mode: false,
        }
    }

    /// Sets the watched fields.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the transformation for one field.
    pub fn with_field_transformation(
        mut self,
        field: impl Into<String>,
        transformation: FieldTransformation,
    ) -> Self {
        self.field_transformations.insert(field.into(), transformation);
        self
    }

    /// Sets the default value for one field.
    pub fn with_default_value(mut self, field: impl Into<String>, value: Value) -> Self {
        self.default_field_values.insert(field.into(), value);
        self
    }

    /// Enables or disables rebound echo suppression.
    pub fn with_rebound(mut self, enabled: bool) -> Self {
        self.enable_rebound = enabled;
        self
    }

    /// Enables or disables passive mode.
    pub fn with_passive_mode(mut self, passive: bool) -> Self {
        self.passive_mode = passive;
        self
    }
}
