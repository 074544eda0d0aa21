//! Durable buffer of captured changes and per-receiver delivery ledger.

mod base;
pub mod memory;
pub mod postgres;

pub use base::BufferStore;
