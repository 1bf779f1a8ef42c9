//! Field identity and channel naming.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prefix of every field channel name.
pub const CHANNEL_PREFIX: &str = "crud>";

/// Identifies one named field of one resource.
///
/// Serialized as `type/id/name`. The resource id may itself contain `/`;
/// the type and the field name may not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    /// Resource type, e.g. `"Product"`.
    pub resource_type: String,
    /// Resource id.
    pub resource_id: String,
    /// Field name.
    pub name: String,
}

impl FieldKey {
    /// Creates a new field key.
    pub fn new(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            name: name.into(),
        }
    }

    /// Returns the pub/sub channel carrying notifications for this field.
    pub fn channel_name(&self) -> String {
        format!("{CHANNEL_PREFIX}{self}")
    }

    /// Parses a channel name of the form `crud>type/id/name`.
    pub fn from_channel_name(channel: &str) -> ProtocolResult<Self> {
        channel
            .strip_prefix(CHANNEL_PREFIX)
            .ok_or_else(|| ProtocolError::InvalidKey(format!("missing channel prefix: {channel}")))?
            .parse()
    }

    /// Returns true if this key belongs to the given resource.
    pub fn is_of_resource(&self, resource_type: &str, resource_id: &str) -> bool {
        self.resource_type == resource_type && self.resource_id == resource_id
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_type, self.resource_id, self.name)
    }
}

impl FromStr for FieldKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> ProtocolResult<Self> {
        let (resource_type, rest) = s
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidKey(s.to_string()))?;
        let (resource_id, name) = rest
            .rsplit_once('/')
            .ok_or_else(|| ProtocolError::InvalidKey(s.to_string()))?;

        if resource_type.is_empty() || resource_id.is_empty() || name.is_empty() {
            return Err(ProtocolError::InvalidKey(s.to_string()));
        }

        Ok(Self::new(resource_type, resource_id, name))
    }
}
