//! Channel broadcasts.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identity of the writer that caused a broadcast.
///
/// Used for echo suppression: a field ignores broadcasts carrying its own id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublisherId(String);

impl PublisherId {
    /// Creates a publisher id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublisherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of change announced by a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// The field was written.
    Update,
    /// The field was created.
    Create,
    /// The field (or its resource) was deleted.
    Delete,
    /// Any other broker-specific type.
    Other(String),
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "update" => MessageType::Update,
            "create" => MessageType::Create,
            "delete" => MessageType::Delete,
            _ => MessageType::Other(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Update => "update".into(),
            MessageType::Create => "create".into(),
            MessageType::Delete => "delete".into(),
            MessageType::Other(s) => s,
        }
    }
}

/// A broadcast received on a field channel.
///
/// Wire shape: `{type, value?, publisherId?}`. A `null` broadcast carries no
/// payload and means "refresh needed"; it is modelled as `Option::None` by
/// [`ChannelMessage::from_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Kind of change.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Pushed value, when the broker includes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Writer that caused the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_id: Option<PublisherId>,
}

impl ChannelMessage {
    /// Creates an update broadcast.
    pub fn update(value: Value, publisher_id: Option<PublisherId>) -> Self {
        Self {
            kind: MessageType::Update,
            value: Some(value),
            publisher_id,
        }
    }

    /// Creates a delete broadcast.
    pub fn delete(publisher_id: Option<PublisherId>) -> Self {
        Self {
            kind: MessageType::Delete,
            value: None,
            publisher_id,
        }
    }

    /// Decodes a raw broadcast; `null` decodes to `None`.
    pub fn from_json(raw: Value) -> ProtocolResult<Option<Self>> {
        if raw.is_null() {
            return Ok(None);
        }
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
    }

    /// Returns true for delete broadcasts.
    pub fn is_delete(&self) -> bool {
        self.kind == MessageType::Delete
    }

    /// Returns true if this broadcast was caused by the given publisher.
    pub fn is_from(&self, publisher_id: Option<&PublisherId>) -> bool {
        match (publisher_id, &self.publisher_id) {
            (Some(own), Some(theirs)) => own == theirs,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_means_refresh() {
        assert_eq!(ChannelMessage::from_json(Value::Null).unwrap(), None);
    }

    #[test]
    fn decodes_delete() {
        let message = ChannelMessage::from_json(json!({"type": "delete"}))
            .unwrap()
            .unwrap();
        assert!(message.is_delete());
        assert_eq!(message.value, None);
    }

    #[test]
    fn unknown_types_are_kept() {
        let message = ChannelMessage::from_json(json!({"type": "patch", "value": [1, 2]}))
            .unwrap()
            .unwrap();
        assert_eq!(message.kind, MessageType::Other("patch".into()));
        assert!(!message.is_delete());
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"type": "patch", "value": [1, 2]})
        );
    }

    #[test]
    fn rejects_non_object_payload() {
        assert!(ChannelMessage::from_json(json!(5)).is_err());
    }

    #[test]
    fn publisher_matching() {
        let own = PublisherId::new("a/1");
        let message = ChannelMessage::update(json!(1), Some(own.clone()));

        assert!(message.is_from(Some(&own)));
        assert!(!message.is_from(Some(&PublisherId::new("a/2"))));
        assert!(!message.is_from(None));
        assert!(!ChannelMessage::delete(None).is_from(Some(&own)));
    }
}
