//! Fork-based worker pool for CPU-bound jobs.
//!
//! A fixed set of persistent worker processes is forked once. Each job runs
//! in a fresh ephemeral process forked by its persistent worker, so memory a
//! job allocates is reclaimed as soon as it finishes, and a crash takes down
//! at most one job.
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────────────────┐
//!                 │        Caller process      │
//!                 │  call / select / get_result│
//!                 └─────────────┬──────────────┘
//!            request pipe │     ▲ response pipe
//!               ┌─────────┴─────┴──┬──────────────────┐
//!               │                  │                  │
//!         ┌─────▼──────┐     ┌─────▼──────┐     ┌─────▼──────┐
//!         │ Persistent │     │ Persistent │     │ Persistent │
//!         │  worker 0  │     │  worker 1  │     │  worker N  │
//!         └─────┬──────┘     └─────┬──────┘     └─────┬──────┘
//!          fork │ per job     fork │ per job     fork │ per job
//!         ┌─────▼──────┐     ┌─────▼──────┐     ┌─────▼──────┐
//!         │ Ephemeral  │     │ Ephemeral  │     │ Ephemeral  │
//!         │ (one job)  │     │ (one job)  │     │ (one job)  │
//!         └────────────┘     └────────────┘     └────────────┘
//! ```
//!
//! # Features
//!
//! - **Memory isolation**: every job runs in its own short-lived process
//! - **Typed faults**: crashes, signals and shared-resource exhaustion are
//!   classified from the worker's exit status
//! - **Readiness polling**: [`select`] harvests finished jobs across many
//!   workers with one `poll(2)`
//! - **Caller-routable refusals**: busy and killed workers return
//!   [`Unavailable`](crate::error::Unavailable) instead of queueing
//!
//! # Example
//!
//! ```no_run
//! use forkpool::worker::{JobRegistry, WorkerPoolConfig, call, make};
//!
//! let mut registry = JobRegistry::new();
//! let incr = registry.register("incr", |x: i64| Ok(x + 1));
//!
//! let config = WorkerPoolConfig::default().with_worker_count(2);
//! let workers = make(&config, &registry, |_| Ok(()), &())?;
//!
//! let handle = call(&workers[0], incr.job(41))?;
//! assert_eq!(handle.get_result()?, 42);
//! # Ok::<(), forkpool::error::WorkerError>(())
//! ```

mod ephemeral;
mod handle;
mod ipc;
mod job;
mod persistent;
mod proc;
mod protocol;
mod select;
pub mod signals;
mod spawn;

pub use handle::{Handle, HandleState, call};
pub use ipc::MAX_FRAME_LEN;
pub use job::{Job, JobKind, JobRegistry, Responder};
pub use proc::Worker;
pub use select::{Selected, select, select_timeout};
pub use signals::{Exhaustion, ProcessStatus};
pub use spawn::{MAX_WORKERS, WorkerContext, WorkerPoolConfig, make};
