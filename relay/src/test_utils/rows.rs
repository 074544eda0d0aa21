use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::source::{ChangeRow, Operation};
use crate::types::Lsn;

/// Builds a change log row at `lsn` with the given operation and column values.
///
/// # Panics
///
/// Panics when `columns` is not a JSON object.
pub fn change_row(lsn: u64, operation: Operation, columns: Value) -> ChangeRow {
    let Value::Object(columns) = columns else {
        panic!("change row columns must be a JSON object");
    };

    ChangeRow {
        lsn: Lsn::from(lsn),
        seqval: Lsn::from(lsn),
        operation: operation.code(),
        commit_time: None,
        columns,
    }
}

/// Builds a change log row committed at `commit_time`.
pub fn change_row_at(
    lsn: u64,
    operation: Operation,
    columns: Value,
    commit_time: DateTime<Utc>,
) -> ChangeRow {
    ChangeRow {
        commit_time: Some(commit_time),
        ..change_row(lsn, operation, columns)
    }
}

/// Builds the two rows of an update committed at `lsn`.
///
/// Both rows share position and sequence, as they do in a real change log.
pub fn update_rows(lsn: u64, old: Value, new: Value) -> [ChangeRow; 2] {
    [
        change_row(lsn, Operation::BeforeUpdate, old),
        change_row(lsn, Operation::AfterUpdate, new),
    ]
}
