//! Metric names and labels emitted by the relay workers.

/// Label for the tracking instance name.
pub const TRACKING_INSTANCE_LABEL: &str = "tracking_instance";

/// Label for the receiver name.
pub const RECEIVER_LABEL: &str = "receiver";

/// Label for the outcome of a delivery (`success`, `failed`, `filtered`, `exhausted`).
pub const OUTCOME_LABEL: &str = "outcome";

/// Counter of changes written to the buffer.
pub const RELAY_CHANGES_BUFFERED_TOTAL: &str = "relay_changes_buffered_total";

/// Counter of source polls that failed.
pub const RELAY_SOURCE_POLL_ERRORS_TOTAL: &str = "relay_source_poll_errors_total";

/// Counter of delivery outcomes recorded by receiver workers.
pub const RELAY_DELIVERIES_TOTAL: &str = "relay_deliveries_total";

/// Histogram of the wall-clock time spent in a receiver's send call.
pub const RELAY_DELIVERY_DURATION_MILLISECONDS: &str = "relay_delivery_duration_milliseconds";

/// Counter of fully delivered events removed by cleanup.
pub const RELAY_EVENTS_CLEANED_TOTAL: &str = "relay_events_cleaned_total";
