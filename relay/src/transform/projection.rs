use serde::Deserialize;
use serde_json::{Map, Value};

use crate::bail;
use crate::error::{ErrorKind, RelayResult};
use crate::parameters::parse_parameters;
use crate::transform::{Transformer, envelope};
use crate::types::TrackedChange;

#[derive(Debug, Deserialize)]
struct Parameters {
    fields: Vec<String>,
}

impl Parameters {
    fn parse(parameters: &Value) -> RelayResult<Self> {
        let parameters: Parameters = parse_parameters(ProjectionTransformer::NAME, parameters)?;
        if parameters.fields.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "Invalid component parameters",
                "Projection: `fields` must not be empty"
            );
        }

        Ok(parameters)
    }
}

/// Keeps only the listed columns of each row image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectionTransformer;

impl ProjectionTransformer {
    pub const NAME: &'static str = "Projection";
}

fn project(image: Option<&Value>, fields: &[String]) -> RelayResult<Option<Value>> {
    let Some(image) = image else {
        return Ok(None);
    };
    let Value::Object(columns) = image else {
        bail!(
            ErrorKind::TransformError,
            "Row image is not an object",
            "Projection can only select columns of object images"
        );
    };

    let projected: Map<String, Value> = fields
        .iter()
        .filter_map(|field| {
            columns
                .get(field)
                .map(|value| (field.clone(), value.clone()))
        })
        .collect();

    Ok(Some(Value::Object(projected)))
}

impl Transformer for ProjectionTransformer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()> {
        Parameters::parse(parameters).map(|_| ())
    }

    fn transform(&self, change: &TrackedChange, parameters: &Value) -> RelayResult<Value> {
        let parameters = Parameters::parse(parameters)?;

        let old = project(change.data.old.as_ref(), &parameters.fields)?;
        let new = project(change.data.new.as_ref(), &parameters.fields)?;

        Ok(envelope(change, old, new))
    }
}
