//! IPC protocol for worker process communication.
//!
//! Messages are MessagePack-encoded and carried in length-prefixed frames
//! (see [`super::ipc`]). The format is private to processes forked from the
//! same binary and makes no compatibility promises across builds.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::metrics::TimingSample;

/// Request from the caller to a worker: which registered job to run and its
/// encoded argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Name the job was registered under.
    pub kind: String,
    /// MessagePack-encoded argument.
    pub input: Vec<u8>,
}

impl Request {
    /// Build a request, encoding the argument.
    pub fn new<A: Serialize>(kind: impl Into<String>, arg: &A) -> Result<Self, WorkerError> {
        let input = rmp_serde::to_vec(arg).map_err(|e| {
            WorkerError::Transmission(format!("cannot encode job argument: {}", e))
        })?;
        Ok(Self {
            kind: kind.into(),
            input,
        })
    }

    /// Decode the argument as `A`.
    pub fn argument<A: DeserializeOwned>(&self) -> Result<A, WorkerError> {
        rmp_serde::from_slice(&self.input).map_err(|e| {
            WorkerError::Protocol(format!("cannot decode argument for '{}': {}", self.kind, e))
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, WorkerError> {
        rmp_serde::to_vec(self)
            .map_err(|e| WorkerError::Transmission(format!("cannot encode request: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WorkerError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| WorkerError::Protocol(format!("cannot decode request: {}", e)))
    }
}

/// Response from a worker to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response<R> {
    /// The job responded with a value.
    Success { result: R, timing: TimingSample },

    /// The job failed; the worker itself is fine.
    Failure { message: String, backtrace: String },
}

impl<R> Response<R> {
    /// Create a failure response.
    pub fn failure(message: impl Into<String>, backtrace: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            backtrace: backtrace.into(),
        }
    }
}

impl<R: Serialize> Response<R> {
    pub fn encode(&self) -> Result<Vec<u8>, WorkerError> {
        rmp_serde::to_vec(self)
            .map_err(|e| WorkerError::Transmission(format!("cannot encode response: {}", e)))
    }
}

impl<R: DeserializeOwned> Response<R> {
    pub fn decode(bytes: &[u8]) -> Result<Self, WorkerError> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| WorkerError::Protocol(format!("cannot decode response: {}", e)))
    }
}
