//! Events emitted by fields and models.

use crate::error::SyncError;
use serde_json::Value;

/// A field value changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Value before the change.
    pub old_value: Value,
    /// Value after the change.
    pub new_value: Value,
    /// True when the change came from the server rather than a local write.
    pub is_remote: bool,
}

/// Event emitted by a [`Field`](crate::Field).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldEvent {
    /// The value changed.
    Change(FieldChange),
    /// A read or subscription failed.
    Error(SyncError),
    /// The field loaded for the first time. Emitted once per lifetime.
    Load,
}

/// A field of a model's resource changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChange {
    /// Resource type.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: String,
    /// Field name.
    pub resource_field: String,
    /// Value before the change.
    pub old_value: Value,
    /// Value after the change.
    pub new_value: Value,
    /// True when the change came from the server rather than a local write.
    pub is_remote: bool,
}

/// Event emitted by a [`Model`](crate::Model).
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// A field of the resource changed.
    Change(ModelChange),
    /// An owned field reported an error.
    Error(SyncError),
    /// Every owned field has loaded. Emitted once per lifetime.
    Load,
}
