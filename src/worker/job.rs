//! Job definitions.
//!
//! Closures cannot cross a pipe, so jobs are registered by name in a
//! [`JobRegistry`] before the pool is forked. Every worker inherits the
//! registry (including whatever state the closures captured) and only the
//! job name plus its encoded argument travel with each request.
//!
//! - `JobRegistry`: name -> job body, built once in the parent
//! - `JobKind<A, R>`: typed token returned by registration
//! - `Job<A, R>`: a kind bound to an argument, ready for [`super::call`]
//! - `Responder<R>`: the capability a job uses to send its result

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::ipc::{FrameWriter, MAX_FRAME_LEN};
use super::protocol::{Request, Response};
use crate::error::WorkerError;
use crate::metrics::ProcessClock;

/// Type-erased job body as stored in the registry.
pub(crate) type ErasedJob =
    Box<dyn Fn(&Request, RawResponder<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Untyped half of a [`Responder`], owned by the ephemeral worker.
pub(crate) struct RawResponder<'a> {
    pub(crate) writer: &'a mut FrameWriter,
    pub(crate) clock: &'a ProcessClock,
    pub(crate) responded: &'a mut bool,
}

/// Capability to send a job's result back to the caller.
///
/// `respond` consumes the responder, so a job can answer at most once. The
/// response is written immediately, which lets a job reply early and keep
/// working (e.g. flushing state to the shared heap) before it returns.
pub struct Responder<'a, R> {
    raw: RawResponder<'a>,
    _result: PhantomData<fn(&R)>,
}

impl<'a, R: Serialize> Responder<'a, R> {
    pub(crate) fn new(raw: RawResponder<'a>) -> Self {
        Self {
            raw,
            _result: PhantomData,
        }
    }

    /// Send `value` as the job's successful result.
    pub fn respond(self, value: &R) -> anyhow::Result<()> {
        let timing = self.raw.clock.sample();
        let frame = Response::Success {
            result: value,
            timing,
        }
        .encode()?;
        if frame.len() > MAX_FRAME_LEN {
            anyhow::bail!(
                "result of {} bytes exceeds frame limit of {}",
                frame.len(),
                MAX_FRAME_LEN
            );
        }
        // Once bytes may have reached the pipe no failure frame can follow.
        *self.raw.responded = true;
        self.raw.writer.write_frame(&frame)?;
        Ok(())
    }
}

/// Registered job bodies, keyed by name.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, ErasedJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job that maps an argument to a result.
    ///
    /// Returning `Err` (or panicking) reports a job failure to the caller.
    /// Returning an [`Exhaustion`](super::Exhaustion) error terminates the
    /// executing process with the matching reserved status instead.
    pub fn register<A, R, F>(&mut self, name: &str, job: F) -> JobKind<A, R>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        self.register_with_responder(name, move |arg: A, responder: Responder<'_, R>| {
            let value = job(arg)?;
            responder.respond(&value)
        })
    }

    /// Register a job that drives its own [`Responder`].
    ///
    /// Returning `Ok` without responding is reported to the caller as a job
    /// failure.
    pub fn register_with_responder<A, R, F>(&mut self, name: &str, job: F) -> JobKind<A, R>
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A, Responder<'_, R>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let erased: ErasedJob = Box::new(move |request: &Request, raw: RawResponder<'_>| {
            let arg = request.argument::<A>()?;
            job(arg, Responder::new(raw))
        });
        if self.jobs.insert(name.to_string(), erased).is_some() {
            tracing::warn!(job = name, "Job registered twice, keeping the later body");
        }
        JobKind {
            name: Arc::from(name),
            _types: PhantomData,
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ErasedJob> {
        self.jobs.get(name)
    }

    /// Whether a job with this name has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("JobRegistry").field("jobs", &names).finish()
    }
}

/// Typed reference to a registered job.
pub struct JobKind<A, R> {
    name: Arc<str>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> JobKind<A, R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind an argument, producing a job ready for submission.
    pub fn job(&self, arg: A) -> Job<A, R> {
        Job {
            kind: self.clone(),
            arg,
        }
    }
}

impl<A, R> Clone for JobKind<A, R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            _types: PhantomData,
        }
    }
}

impl<A, R> fmt::Debug for JobKind<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobKind").field(&self.name).finish()
    }
}

/// A registered job plus its argument.
pub struct Job<A, R> {
    kind: JobKind<A, R>,
    arg: A,
}

impl<A: Serialize, R> Job<A, R> {
    pub fn kind(&self) -> &str {
        self.kind.name()
    }

    pub fn arg(&self) -> &A {
        &self.arg
    }

    pub(crate) fn to_request(&self) -> Result<Request, WorkerError> {
        Request::new(self.kind.name(), &self.arg)
    }
}

impl<A: fmt::Debug, R> fmt::Debug for Job<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind.name())
            .field("arg", &self.arg)
            .finish()
    }
}
