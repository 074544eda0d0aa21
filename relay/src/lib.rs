//! Change capture and redistribution.
//!
//! Changes are read from a database change log by one source worker per tracking instance,
//! durably buffered in a [`store::BufferStore`], and delivered by one receiver worker per
//! configured receiver after optional filtering and transformation. The [`orchestrator`] wires
//! everything together from configuration.

pub mod concurrency;
pub mod error;
pub mod factory;
pub mod filter;
mod macros;
pub mod metrics;
pub mod migrations;
pub mod orchestrator;
mod parameters;
pub mod receiver;
pub mod source;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transform;
pub mod types;
pub mod workers;
