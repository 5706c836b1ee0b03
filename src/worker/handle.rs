//! Job submission and result handles.
//!
//! [`call`] hands a job to an idle worker and returns a [`Handle`] right
//! after the request is flushed. The handle is a single-assignment future:
//! the first [`Handle::get_result`] reads the response and stores the
//! outcome, and every later read returns the stored outcome.

use std::fmt;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use super::ipc::MAX_FRAME_LEN;
use super::job::Job;
use super::proc::Worker;
use super::protocol::Response;
use crate::error::{Result, Unavailable, WorkerError};
use crate::metrics;

/// Submit `job` to `worker`.
///
/// Fails with [`WorkerError::Unavailable`] if the worker is busy or killed;
/// routing to another worker is up to the caller. Blocks only until the
/// request is written.
pub fn call<A, R>(worker: &Worker, job: Job<A, R>) -> Result<Handle<R>>
where
    A: Serialize,
{
    worker.acquire()?;
    match submit(worker, &job) {
        Ok(()) => {
            trace!(worker_id = worker.id(), job = job.kind(), "Job submitted");
            Ok(Handle::processing(worker.clone()))
        }
        Err(e) => {
            worker.release();
            Err(e)
        }
    }
}

fn submit<A: Serialize, R>(worker: &Worker, job: &Job<A, R>) -> Result<()> {
    let frame = job.to_request()?.encode()?;
    if frame.len() > MAX_FRAME_LEN {
        return Err(WorkerError::Transmission(format!(
            "request of {} bytes exceeds frame limit of {}",
            frame.len(),
            MAX_FRAME_LEN
        )));
    }

    let written = {
        let mut channels = worker.channels();
        let Some(channels) = channels.as_mut() else {
            return Err(Unavailable::Killed(worker.id()).into());
        };
        channels.requests.write_frame(&frame)
    };

    written.map_err(|e| {
        // EPIPE means no process holds the read end any more.
        let gone = e.kind() == io::ErrorKind::BrokenPipe;
        worker.fault(gone).unwrap_or_else(|| {
            WorkerError::Transmission(format!(
                "cannot send request to worker {}: {}",
                worker.id(),
                e
            ))
        })
    })
}

/// Where a [`Handle`] is in its lifecycle.
#[derive(Debug)]
pub enum HandleState<R> {
    /// Submitted; the response has not been read.
    Processing { worker: Worker },
    /// The job's result.
    Cached(R),
    /// The job or its worker failed.
    Failed(WorkerError),
}

impl<R> HandleState<R> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Processing { .. })
    }
}

/// Future-like reference to a submitted job's result.
pub struct Handle<R> {
    state: Mutex<HandleState<R>>,
}

impl<R> Handle<R> {
    fn processing(worker: Worker) -> Self {
        Self {
            state: Mutex::new(HandleState::Processing { worker }),
        }
    }

    /// A handle that already holds a result.
    pub fn cached(value: R) -> Self {
        Self {
            state: Mutex::new(HandleState::Cached(value)),
        }
    }

    /// A handle that already holds a failure.
    pub fn failed(error: WorkerError) -> Self {
        Self {
            state: Mutex::new(HandleState::Failed(error)),
        }
    }

    /// Current state, for diagnostics. Blocks while another thread is
    /// inside `get_result` on this handle.
    pub fn state(&self) -> MutexGuard<'_, HandleState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn try_state(&self) -> Option<MutexGuard<'_, HandleState<R>>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Whether the outcome is stored and `get_result` returns immediately.
    pub fn is_ready(&self) -> bool {
        self.state().is_terminal()
    }

    /// The worker running this job, while it is still processing.
    pub fn worker(&self) -> Option<Worker> {
        match &*self.state() {
            HandleState::Processing { worker } => Some(worker.clone()),
            _ => None,
        }
    }
}

impl<R: Clone + DeserializeOwned> Handle<R> {
    /// The job's result, blocking until the worker answers.
    ///
    /// The first completed read is stored; later calls return clones of the
    /// same result or error without touching the worker.
    pub fn get_result(&self) -> Result<R> {
        let mut state = self.state();
        let worker = match &*state {
            HandleState::Cached(value) => return Ok(value.clone()),
            HandleState::Failed(error) => return Err(error.clone()),
            HandleState::Processing { worker } => worker.clone(),
        };

        let outcome = read_response::<R>(&worker);
        *state = match &outcome {
            Ok(value) => HandleState::Cached(value.clone()),
            Err(error) => HandleState::Failed(error.clone()),
        };
        outcome
    }
}

fn read_response<R: DeserializeOwned>(worker: &Worker) -> Result<R> {
    if worker.is_killed() {
        metrics::global().record_failure();
        return Err(worker.killed_fault());
    }

    let read = match worker.channels().as_mut() {
        Some(channels) => channels.responses.read_frame(),
        None => {
            metrics::global().record_failure();
            return Err(worker.killed_fault());
        }
    };

    let (error, ended) = match read {
        Ok(Some(frame)) => match Response::<R>::decode(&frame) {
            Ok(Response::Success { result, timing }) => {
                worker.release();
                metrics::global().merge(&timing);
                return Ok(result);
            }
            Ok(Response::Failure { message, backtrace }) => {
                worker.release();
                metrics::global().record_failure();
                return Err(WorkerError::JobFailed { message, backtrace });
            }
            Err(e) => (e, false),
        },
        Ok(None) => (
            WorkerError::Protocol(format!(
                "worker {} closed its response channel",
                worker.id()
            )),
            true,
        ),
        Err(e) => {
            let ended = e.kind() == io::ErrorKind::UnexpectedEof;
            (WorkerError::from(e), ended)
        }
    };

    metrics::global().record_failure();
    if worker.is_killed() {
        return Err(worker.killed_fault());
    }
    let error = worker.fault(ended).unwrap_or(error);
    debug!(worker_id = worker.id(), error = %error, "Failed to read job result");
    Err(error)
}

impl<R> fmt::Debug for Handle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.try_state().as_deref() {
            Some(HandleState::Processing { .. }) => "processing",
            Some(HandleState::Cached(_)) => "cached",
            Some(HandleState::Failed(_)) => "failed",
            None => "locked",
        };
        f.debug_struct("Handle").field("state", &state).finish()
    }
}
