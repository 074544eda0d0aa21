use serde::Deserialize;
use serde_json::Value;

use crate::error::RelayResult;
use crate::filter::{Filter, match_parameters};
use crate::parameters::parse_parameters;
use crate::types::{ChangeType, TrackedChange};

#[derive(Debug, Deserialize)]
struct Parameters {
    change_types: Vec<ChangeType>,
}

/// Keeps changes whose type is listed in `change_types`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeTypeFilter;

impl ChangeTypeFilter {
    pub const NAME: &'static str = "ChangeType";
}

impl Filter for ChangeTypeFilter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()> {
        parse_parameters::<Parameters>(Self::NAME, parameters).map(|_| ())
    }

    fn is_match(&self, change: &TrackedChange, parameters: &Value) -> RelayResult<bool> {
        let parameters: Parameters = match_parameters(Self::NAME, parameters)?;

        Ok(parameters.change_types.contains(&change.change_type))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn matches_listed_types_only() {
        let parameters = json!({"change_types": ["Insert", "Update"]});
        let now = Utc::now();

        let insert = TrackedChange::insert("orders", "1", now, json!({"id": 1}));
        let delete = TrackedChange::delete("orders", "2", now, json!({"id": 1}));

        assert!(ChangeTypeFilter.is_match(&insert, &parameters).unwrap());
        assert!(!ChangeTypeFilter.is_match(&delete, &parameters).unwrap());
    }

    #[test]
    fn rejects_unknown_types() {
        let err = ChangeTypeFilter
            .validate_parameters(&json!({"change_types": ["Upsert"]}))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(ChangeTypeFilter.validate_parameters(&Value::Null).is_err());
    }

    #[test]
    fn unusable_parameters_fail_the_match() {
        let insert = TrackedChange::insert("orders", "1", Utc::now(), json!({"id": 1}));

        let err = ChangeTypeFilter
            .is_match(&insert, &json!({"change_types": "Insert"}))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::FilterError);
    }
}
