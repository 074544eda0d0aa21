use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ErrorKind, RelayResult};
use crate::relay_error;

/// Parses the opaque parameter document of a component into its typed form.
///
/// A missing document (`null`) is read as an empty object so components with optional
/// parameters need no configuration at all.
pub(crate) fn parse_parameters<T>(component: &'static str, parameters: &Value) -> RelayResult<T>
where
    T: DeserializeOwned,
{
    let parameters = match parameters {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };

    serde_json::from_value(parameters).map_err(|err| {
        relay_error!(
            ErrorKind::ConfigError,
            "Invalid component parameters",
            format!("{component}: {err}"),
            source: err
        )
    })
}
