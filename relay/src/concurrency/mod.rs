//! Concurrency primitives used to coordinate workers.
//!
//! Every worker observes the same shutdown signal. Shutdown is cooperative: workers check the
//! signal at the top of each loop iteration and while sleeping between polls, and let in-flight
//! store writes and deliveries complete.

pub mod shutdown;
