//! Error types for forkpool.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::worker::signals::{Exhaustion, ProcessStatus};

/// Why a worker refused a job.
///
/// These are routing outcomes rather than execution faults: the job never
/// left the caller, so it can be offered to another worker.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    #[error("worker {0} is busy")]
    Busy(usize),

    #[error("worker {0} has been killed")]
    Killed(usize),

    /// No worker in the pool could take the job.
    #[error("no idle worker left to run the job ({killed} killed, {busy} busy)")]
    NoIdleWorker { killed: usize, busy: usize },
}

/// Main error type for forkpool.
///
/// Cloneable so that a [`Handle`](crate::worker::Handle) can hand out the
/// same stored failure on every read.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("Invalid worker count {count}: must be at least 1 and below {max}")]
    InvalidWorkerCount { count: usize, max: usize },

    #[error(transparent)]
    Unavailable(#[from] Unavailable),

    #[error("Job failed: {message}")]
    JobFailed { message: String, backtrace: String },

    #[error(transparent)]
    Exhausted(#[from] Exhaustion),

    #[error("Worker {worker} was killed by SIGKILL, likely out of memory")]
    OutOfMemory { worker: usize },

    #[error("Worker {worker} terminated abnormally: {status}")]
    AbnormalTermination { worker: usize, status: ProcessStatus },

    #[error("Failed to transmit job: {0}")]
    Transmission(String),

    #[error("Malformed worker message: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl WorkerError {
    /// Whether the job was refused before submission and can be routed to
    /// another worker.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether the worker process that produced this error is gone.
    pub fn is_worker_lost(&self) -> bool {
        matches!(
            self,
            Self::Exhausted(_) | Self::OutOfMemory { .. } | Self::AbnormalTermination { .. }
        )
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<nix::errno::Errno> for WorkerError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(Arc::new(io::Error::from_raw_os_error(errno as i32)))
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, WorkerError>;
