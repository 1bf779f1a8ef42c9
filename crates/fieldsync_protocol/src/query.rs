//! RPC payloads for the `crud` procedure.

use crate::key::FieldKey;
use crate::message::PublisherId;
use crate::transform::FieldTransformation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the RPC procedure that carries every CRUD query.
pub const CRUD_PROCEDURE: &str = "crud";

/// CRUD action requested by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudAction {
    /// Read a field value.
    Read,
    /// Overwrite a field value.
    Update,
    /// Delete a field, or the whole resource when no field is given.
    Delete,
}

/// A query sent through the `crud` procedure.
///
/// Wire shape: `{action, type, id, field?, value?, sliceTo?, publisherId?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrudQuery {
    /// Requested action.
    pub action: CrudAction,
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource id.
    #[serde(rename = "id")]
    pub resource_id: String,
    /// Target field; `None` addresses the whole resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// New value for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Read-side slice limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_to: Option<usize>,
    /// Publisher that caused a write, echoed back on the channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<PublisherId>,
}

impl CrudQuery {
    fn scoped(action: CrudAction, resource_type: &str, resource_id: &str) -> Self {
        Self {
            action,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            field: None,
            value: None,
            slice_to: None,
            publisher_id: None,
        }
    }

    /// Creates a read query for a field.
    pub fn read(key: &FieldKey, transformation: Option<&FieldTransformation>) -> Self {
        let mut query = Self::scoped(CrudAction::Read, &key.resource_type, &key.resource_id);
        query.field = Some(key.name.clone());
        query.slice_to = transformation.and_then(|t| t.slice_to);
        query
    }

    /// Creates an update query for a field.
    pub fn update(key: &FieldKey, value: Value, publisher_id: Option<PublisherId>) -> Self {
        let mut query = Self::scoped(CrudAction::Update, &key.resource_type, &key.resource_id);
        query.field = Some(key.name.clone());
        query.value = Some(value);
        query.publisher_id = publisher_id;
        query
    }

    /// Creates a delete query for a single field.
    pub fn delete_field(key: &FieldKey, publisher_id: Option<PublisherId>) -> Self {
        let mut query = Self::scoped(CrudAction::Delete, &key.resource_type, &key.resource_id);
        query.field = Some(key.name.clone());
        query.publisher_id = publisher_id;
        query
    }

    /// Creates a delete query for a whole resource.
    pub fn delete_resource(
        resource_type: &str,
        resource_id: &str,
        publisher_id: Option<PublisherId>,
    ) -> Self {
        let mut query = Self::scoped(CrudAction::Delete, resource_type, resource_id);
        query.publisher_id = publisher_id;
        query
    }

    /// Returns the addressed field key, if the query targets a field.
    pub fn field_key(&self) -> Option<FieldKey> {
        self.field
            .as_ref()
            .map(|name| FieldKey::new(&self.resource_type, &self.resource_id, name))
    }
}
