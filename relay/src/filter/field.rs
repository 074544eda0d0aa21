use serde::Deserialize;
use serde_json::Value;

use crate::bail;
use crate::error::{ErrorKind, RelayResult};
use crate::filter::{Filter, match_parameters};
use crate::parameters::parse_parameters;
use crate::types::TrackedChange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Image {
    #[default]
    New,
    Old,
}

#[derive(Debug, Deserialize)]
struct Parameters {
    field: String,
    #[serde(default)]
    image: Option<Image>,
    #[serde(default)]
    equals: Option<Value>,
    #[serde(default)]
    one_of: Option<Vec<Value>>,
}

impl Parameters {
    fn validate(self) -> RelayResult<Self> {
        match (&self.equals, &self.one_of) {
            (Some(_), None) | (None, Some(_)) => Ok(self),
            _ => bail!(
                ErrorKind::ConfigError,
                "Invalid component parameters",
                "Field: exactly one of `equals` and `one_of` must be set"
            ),
        }
    }
}

/// Keeps changes whose row image holds an expected value in `field`.
///
/// Without an explicit `image` the new image is inspected, or the old one for deletes. A field
/// missing from the image never matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldFilter;

impl FieldFilter {
    pub const NAME: &'static str = "Field";
}

impl Filter for FieldFilter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()> {
        parse_parameters::<Parameters>(Self::NAME, parameters)?
            .validate()
            .map(|_| ())
    }

    fn is_match(&self, change: &TrackedChange, parameters: &Value) -> RelayResult<bool> {
        let parameters = match_parameters::<Parameters>(Self::NAME, parameters)?;

        let image = match parameters.image {
            Some(Image::New) => change.data.new.as_ref(),
            Some(Image::Old) => change.data.old.as_ref(),
            None => change.data.new.as_ref().or(change.data.old.as_ref()),
        };
        let Some(image) = image else {
            return Ok(false);
        };
        let Value::Object(columns) = image else {
            bail!(
                ErrorKind::FilterError,
                "Row image is not an object",
                format!("Field: cannot read `{}` from row {}", parameters.field, change.row_label)
            );
        };
        let Some(actual) = columns.get(&parameters.field) else {
            return Ok(false);
        };

        Ok(match (&parameters.equals, &parameters.one_of) {
            (Some(expected), _) => actual == expected,
            (None, Some(candidates)) => candidates.contains(actual),
            (None, None) => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn update() -> TrackedChange {
        TrackedChange::update(
            "orders",
            "7",
            Utc::now(),
            json!({"status": "open", "qty": 1}),
            json!({"status": "shipped", "qty": 1}),
        )
    }

    #[test]
    fn compares_the_new_image_by_default() {
        let change = update();

        assert!(FieldFilter
            .is_match(&change, &json!({"field": "status", "equals": "shipped"}))
            .unwrap());
        assert!(!FieldFilter
            .is_match(&change, &json!({"field": "status", "equals": "open"}))
            .unwrap());
        assert!(FieldFilter
            .is_match(
                &change,
                &json!({"field": "status", "image": "old", "one_of": ["open", "draft"]})
            )
            .unwrap());
    }

    #[test]
    fn deletes_fall_back_to_the_old_image() {
        let change = TrackedChange::delete("orders", "8", Utc::now(), json!({"status": "open"}));

        assert!(FieldFilter
            .is_match(&change, &json!({"field": "status", "equals": "open"}))
            .unwrap());
        assert!(!FieldFilter
            .is_match(&change, &json!({"field": "missing", "equals": "open"}))
            .unwrap());
    }

    #[test]
    fn requires_exactly_one_comparison() {
        assert!(FieldFilter
            .validate_parameters(&json!({"field": "status"}))
            .is_err());
        assert!(FieldFilter
            .validate_parameters(&json!({"field": "status", "equals": 1, "one_of": [1]}))
            .is_err());
        assert!(FieldFilter
            .validate_parameters(&json!({"field": "status", "one_of": [1]}))
            .is_ok());
    }

    #[test]
    fn non_object_images_fail_the_match() {
        let change = TrackedChange::insert("orders", "9", Utc::now(), json!([1, 2]));

        let err = FieldFilter
            .is_match(&change, &json!({"field": "status", "equals": "open"}))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FilterError);
    }
}
