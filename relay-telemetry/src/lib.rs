//! Logging and metrics setup shared by the relay binaries and tests.

pub mod metrics;
pub mod tracing;
