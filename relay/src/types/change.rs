use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, RelayError, RelayResult};

/// Kind of row mutation captured from the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "Insert",
            ChangeType::Update => "Update",
            ChangeType::Delete => "Delete",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Insert" => Ok(ChangeType::Insert),
            "Update" => Ok(ChangeType::Update),
            "Delete" => Ok(ChangeType::Delete),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown change type",
                format!("'{other}' is not one of Insert, Update, Delete")
            ),
        }
    }
}

/// Row images attached to a change.
///
/// Inserts only carry `new`, deletes only carry `old` and updates carry both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
}

impl ChangeData {
    /// Returns the image matching the given name (`old` or `new`).
    pub fn image(&self, name: &str) -> Option<&Value> {
        match name {
            "old" => self.old.as_ref(),
            "new" => self.new.as_ref(),
            _ => None,
        }
    }
}

/// One captured row mutation.
///
/// The row label is the position of the change in the source log and doubles as the resumable
/// cursor value for its tracking instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedChange {
    pub change_type: ChangeType,
    pub tracking_instance: String,
    pub created_at: DateTime<Utc>,
    pub row_label: String,
    pub data: ChangeData,
    /// Output of the receiver's transformer for the current delivery attempt.
    ///
    /// Never serialized, so it can't leak into the shared buffered copy of the change.
    #[serde(skip)]
    pub transformed_data: Option<Value>,
}

impl TrackedChange {
    pub fn insert(
        tracking_instance: impl Into<String>,
        row_label: impl Into<String>,
        created_at: DateTime<Utc>,
        new: Value,
    ) -> Self {
        Self::new(
            ChangeType::Insert,
            tracking_instance,
            row_label,
            created_at,
            ChangeData {
                old: None,
                new: Some(new),
            },
        )
    }

    pub fn update(
        tracking_instance: impl Into<String>,
        row_label: impl Into<String>,
        created_at: DateTime<Utc>,
        old: Value,
        new: Value,
    ) -> Self {
        Self::new(
            ChangeType::Update,
            tracking_instance,
            row_label,
            created_at,
            ChangeData {
                old: Some(old),
                new: Some(new),
            },
        )
    }

    pub fn delete(
        tracking_instance: impl Into<String>,
        row_label: impl Into<String>,
        created_at: DateTime<Utc>,
        old: Value,
    ) -> Self {
        Self::new(
            ChangeType::Delete,
            tracking_instance,
            row_label,
            created_at,
            ChangeData {
                old: Some(old),
                new: None,
            },
        )
    }

    fn new(
        change_type: ChangeType,
        tracking_instance: impl Into<String>,
        row_label: impl Into<String>,
        created_at: DateTime<Utc>,
        data: ChangeData,
    ) -> Self {
        Self {
            change_type,
            tracking_instance: tracking_instance.into(),
            created_at,
            row_label: row_label.into(),
            data,
            transformed_data: None,
        }
    }

    /// Serializes the change without its transient transformed payload.
    pub fn to_json(&self) -> RelayResult<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transformed_data_is_never_serialized() {
        let mut change = TrackedChange::insert("orders", "101", Utc::now(), json!({"id": 1}));
        change.transformed_data = Some(json!({"secret": true}));

        let value = change.to_json().unwrap();
        assert!(value.get("transformed_data").is_none());

        let restored: TrackedChange = serde_json::from_value(value).unwrap();
        assert_eq!(restored.transformed_data, None);
        assert_eq!(restored.data.new, Some(json!({"id": 1})));
    }

    #[test]
    fn constructors_follow_image_rules() {
        let now = Utc::now();
        let insert = TrackedChange::insert("t", "1", now, json!({"a": 1}));
        let delete = TrackedChange::delete("t", "2", now, json!({"a": 1}));
        let update = TrackedChange::update("t", "3", now, json!({"a": 1}), json!({"a": 2}));

        assert!(insert.data.old.is_none() && insert.data.new.is_some());
        assert!(delete.data.old.is_some() && delete.data.new.is_none());
        assert!(update.data.old.is_some() && update.data.new.is_some());
    }

    #[test]
    fn change_type_parses_known_names_only() {
        assert_eq!("Delete".parse::<ChangeType>().unwrap(), ChangeType::Delete);
        assert_eq!(
            "delete".parse::<ChangeType>().unwrap_err().kind(),
            ErrorKind::InvalidData
        );
    }
}
