//! Helpers for exercising workers and the orchestrator.
//!
//! Most of them run in memory: [`crate::source::memory::MemoryChangeLog`] stands in for the
//! change log, [`crate::store::memory::MemoryStore`] for the buffer and [`receiver::RecordingReceiver`]
//! for a delivery target. [`database`] provisions a throwaway Postgres database for the durable
//! store.

pub mod config;
pub mod database;
pub mod notify;
pub mod receiver;
pub mod rows;
