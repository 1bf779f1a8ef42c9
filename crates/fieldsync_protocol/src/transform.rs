//! Read-side value transformations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transformation requested when reading a field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldTransformation {
    /// Truncate strings (in chars) and arrays (in elements) to this length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_to: Option<usize>,
}

impl FieldTransformation {
    /// Creates a transformation that slices values to `len`.
    pub fn slice_to(len: usize) -> Self {
        Self {
            slice_to: Some(len),
        }
    }

    /// Applies the transformation to a stored value.
    ///
    /// Values other than strings and arrays are returned unchanged.
    pub fn apply(&self, value: Value) -> Value {
        let Some(len) = self.slice_to else {
            return value;
        };
        match value {
            Value::String(s) => Value::String(s.chars().take(len).collect()),
            Value::Array(mut items) => {
                items.truncate(len);
                Value::Array(items)
            }
            other => other,
        }
    }
}
