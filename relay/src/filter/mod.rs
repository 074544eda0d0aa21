//! Per-receiver predicates deciding which changes get delivered.

mod change_type;
mod field;

pub use change_type::ChangeTypeFilter;
pub use field::FieldFilter;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ErrorKind, RelayResult};
use crate::parameters::parse_parameters;
use crate::relay_error;
use crate::types::TrackedChange;

/// Decides whether a change should be delivered to a receiver.
pub trait Filter: Send + Sync {
    /// Name the filter is registered and configured under.
    fn name(&self) -> &'static str;

    /// Checks `parameters` once, before any worker uses them.
    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()>;

    fn is_match(&self, change: &TrackedChange, parameters: &Value) -> RelayResult<bool>;
}

/// Parses parameters while matching a change.
///
/// Parameters are validated at start, so a failure here is reported against the change being
/// filtered rather than as a configuration error.
fn match_parameters<T>(filter: &'static str, parameters: &Value) -> RelayResult<T>
where
    T: DeserializeOwned,
{
    parse_parameters(filter, parameters).map_err(|err| {
        relay_error!(
            ErrorKind::FilterError,
            "Filter parameters could not be applied",
            filter,
            source: err
        )
    })
}
