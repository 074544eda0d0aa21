//! Per-receiver payload transformations.

mod projection;
mod rename;

pub use projection::ProjectionTransformer;
pub use rename::RenameTransformer;

use serde_json::{Value, json};

use crate::error::RelayResult;
use crate::types::TrackedChange;

/// Computes the document delivered to a receiver instead of the raw change.
pub trait Transformer: Send + Sync {
    /// Name the transformer is registered and configured under.
    fn name(&self) -> &'static str;

    /// Checks `parameters` once, before any worker uses them.
    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()>;

    fn transform(&self, change: &TrackedChange, parameters: &Value) -> RelayResult<Value>;
}

/// Builds the document shared by the built-in transformers around rewritten row images.
fn envelope(change: &TrackedChange, old: Option<Value>, new: Option<Value>) -> Value {
    json!({
        "change_type": change.change_type,
        "tracking_instance": change.tracking_instance,
        "row_label": change.row_label,
        "created_at": change.created_at,
        "old": old,
        "new": new,
    })
}
