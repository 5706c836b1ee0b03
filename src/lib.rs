//! forkpool - fork-based worker pool for CPU-bound jobs
//!
//! Jobs run in short-lived processes forked from a fixed set of long-lived
//! workers, and come back through future-like handles that a scheduler can
//! multiplex with [`worker::select`]. See [`worker`] for the architecture.

pub mod dispatch;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod worker;

pub use error::{Result, Unavailable, WorkerError};
