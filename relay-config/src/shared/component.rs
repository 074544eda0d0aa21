use std::fmt;

use serde::Deserialize;
use serde_json::Value;

/// A named connection to a change source.
///
/// `type` selects the source implementation; `parameters` is handed to it untouched. Parameters
/// commonly hold credentials, so [`fmt::Debug`] only lists their keys and the type does not
/// implement `Serialize`.
#[derive(Clone, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parameters", &ParameterKeys(&self.parameters))
            .finish()
    }
}

struct ParameterKeys<'a>(&'a Value);

impl fmt::Debug for ParameterKeys<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Object(map) => f.debug_list().entries(map.keys()).finish(),
            _ => f.write_str("<redacted>"),
        }
    }
}

/// Reference to a pluggable component (filter, transformer) with its parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_output_hides_parameter_values() {
        let config: ConnectionConfig = serde_json::from_value(json!({
            "name": "erp",
            "type": "SqlServer",
            "parameters": {"host": "db", "password": "hunter2"}
        }))
        .unwrap();

        let rendered = format!("{config:?}");
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(config.kind, "SqlServer");
    }
}
