use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, RelayResult};
use crate::parameters::parse_parameters;
use crate::transform::{Transformer, envelope};
use crate::types::TrackedChange;

#[derive(Debug, Deserialize)]
struct Parameters {
    fields: HashMap<String, String>,
}

impl Parameters {
    /// Rejects mappings sending two columns to the same name.
    fn validate(self) -> RelayResult<Self> {
        let mut targets = HashSet::with_capacity(self.fields.len());
        for target in self.fields.values() {
            if !targets.insert(target.as_str()) {
                bail!(
                    ErrorKind::ConfigError,
                    "Invalid component parameters",
                    format!("Rename: more than one column is renamed to `{target}`")
                );
            }
        }

        Ok(self)
    }
}

/// Renames columns of each row image, leaving unlisted columns untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenameTransformer;

impl RenameTransformer {
    pub const NAME: &'static str = "Rename";
}

fn rename(image: Option<&Value>, fields: &HashMap<String, String>) -> RelayResult<Option<Value>> {
    let Some(image) = image else {
        return Ok(None);
    };
    let Value::Object(columns) = image else {
        bail!(
            ErrorKind::TransformError,
            "Row image is not an object",
            "Rename can only rename columns of object images"
        );
    };

    // A target may still clash with a column the mapping leaves in place.
    let mut renamed = Map::with_capacity(columns.len());
    for (column, value) in columns {
        let name = fields.get(column).unwrap_or(column);
        if renamed.insert(name.clone(), value.clone()).is_some() {
            bail!(
                ErrorKind::TransformError,
                "Renamed column collides with an existing one",
                format!("Rename: column `{name}` would be written twice")
            );
        }
    }

    Ok(Some(Value::Object(renamed)))
}

impl Transformer for RenameTransformer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()> {
        parse_parameters::<Parameters>(Self::NAME, parameters)?
            .validate()
            .map(|_| ())
    }

    fn transform(&self, change: &TrackedChange, parameters: &Value) -> RelayResult<Value> {
        let parameters = parse_parameters::<Parameters>(Self::NAME, parameters)?.validate()?;

        let old = rename(change.data.old.as_ref(), &parameters.fields)?;
        let new = rename(change.data.new.as_ref(), &parameters.fields)?;

        Ok(envelope(change, old, new))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    #[test]
    fn renames_listed_columns() {
        let change = TrackedChange::delete(
            "orders",
            "20",
            Utc::now(),
            json!({"OrderID": 5, "Status": "void"}),
        );

        let output = RenameTransformer
            .transform(&change, &json!({"fields": {"OrderID": "order_id"}}))
            .unwrap();

        assert_eq!(output["change_type"], json!("Delete"));
        assert_eq!(output["old"], json!({"order_id": 5, "Status": "void"}));
        assert_eq!(output["new"], Value::Null);
    }

    #[test]
    fn rejects_two_columns_renamed_to_the_same_name() {
        let err = RenameTransformer
            .validate_parameters(&json!({"fields": {"OrderID": "id", "OrderKey": "id"}}))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(RenameTransformer
            .validate_parameters(&json!({"fields": {"a": "b", "b": "a"}}))
            .is_ok());
    }

    #[test]
    fn swaps_columns_without_losing_values() {
        let change = TrackedChange::insert("orders", "21", Utc::now(), json!({"a": 1, "b": 2}));

        let output = RenameTransformer
            .transform(&change, &json!({"fields": {"a": "b", "b": "a"}}))
            .unwrap();

        assert_eq!(output["new"], json!({"a": 2, "b": 1}));
    }

    #[test]
    fn fails_when_a_target_clashes_with_a_kept_column() {
        let change = TrackedChange::insert(
            "orders",
            "22",
            Utc::now(),
            json!({"OrderID": 5, "order_id": 6}),
        );

        let err = RenameTransformer
            .transform(&change, &json!({"fields": {"OrderID": "order_id"}}))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransformError);
    }
}
