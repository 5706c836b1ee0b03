//! Worker pool creation.
//!
//! Workers are plain `fork(2)` children of the caller, not re-executed
//! binaries: the job registry and the shared heap handle are inherited
//! as-is, so nothing but job arguments and results ever needs encoding.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{ForkResult, fork};
use tracing::{debug, error, info, instrument};

use super::ipc::{FrameReader, FrameWriter, pipe};
use super::job::JobRegistry;
use super::persistent;
use super::proc::{Channels, Worker};
use super::signals::EXIT_CHANNEL_CLOSED;
use crate::error::{Result, WorkerError};

/// Exclusive upper bound on the number of workers in a pool.
pub const MAX_WORKERS: usize = 1000;

/// Exit status of a worker whose own setup panicked.
const EXIT_SETUP_PANICKED: i32 = 101;

/// Configuration for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of persistent worker processes to fork.
    pub worker_count: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(MAX_WORKERS - 1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Apply `FORKPOOL_WORKERS` if it is set to a number.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("FORKPOOL_WORKERS") {
            match value.trim().parse() {
                Ok(count) => self.worker_count = count,
                Err(_) => {
                    tracing::warn!(value = %value, "Ignoring non-numeric FORKPOOL_WORKERS");
                }
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 || self.worker_count >= MAX_WORKERS {
            return Err(WorkerError::InvalidWorkerCount {
                count: self.worker_count,
                max: MAX_WORKERS,
            });
        }
        Ok(())
    }
}

/// What a freshly forked worker knows about itself.
#[derive(Debug)]
pub struct WorkerContext<'a, H> {
    /// Position of the worker in its pool.
    pub worker_id: usize,
    /// The shared heap handle passed to [`make`].
    pub heap: &'a H,
}

static PARENT_INIT: Once = Once::new();

/// One-time setup of the calling process.
fn init_parent() {
    PARENT_INIT.call_once(|| {
        // A worker dying mid-write must surface as EPIPE, not kill the caller.
        // Safety: ignoring a signal installs no handler code.
        unsafe {
            let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
    });
}

fn flush_stdio() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

/// Fork `config.worker_count` persistent workers.
///
/// Each worker runs `restore` once, right after the fork and before it
/// accepts any job, to re-attach to `heap` and apply per-process setup. A
/// failing `restore` ends that worker with the "channel closed" status.
///
/// On error, workers already created are killed.
#[instrument(level = "debug", skip(config, registry, restore, heap), fields(workers = config.worker_count))]
pub fn make<H, F>(
    config: &WorkerPoolConfig,
    registry: &JobRegistry,
    restore: F,
    heap: &H,
) -> Result<Vec<Worker>>
where
    F: Fn(&WorkerContext<'_, H>) -> anyhow::Result<()>,
{
    config.validate()?;
    init_parent();

    let mut workers = Vec::with_capacity(config.worker_count);
    for worker_id in 0..config.worker_count {
        match spawn_worker(worker_id, &workers, registry, &restore, heap) {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                error!(worker_id, error = %e, "Failed to spawn worker");
                for worker in &workers {
                    worker.kill();
                }
                return Err(e);
            }
        }
    }

    info!(workers = workers.len(), "Worker pool started");
    Ok(workers)
}

fn spawn_worker<H, F>(
    worker_id: usize,
    siblings: &[Worker],
    registry: &JobRegistry,
    restore: &F,
    heap: &H,
) -> Result<Worker>
where
    F: Fn(&WorkerContext<'_, H>) -> anyhow::Result<()>,
{
    let (request_read, request_write) = pipe()?;
    let (response_read, response_write) = pipe()?;

    flush_stdio();

    // Safety: the child never returns into the caller's code; it runs the
    // worker loop and exits.
    match unsafe { fork() }? {
        ForkResult::Child => {
            drop(request_write);
            drop(response_read);
            for sibling in siblings {
                sibling.close_channels();
            }

            let served: std::thread::Result<()> = panic::catch_unwind(AssertUnwindSafe(|| {
                let context = WorkerContext { worker_id, heap };
                if let Err(e) = restore(&context) {
                    error!(worker_id, error = %format!("{:#}", e), "Worker restore failed");
                    std::process::exit(EXIT_CHANNEL_CLOSED);
                }
                persistent::serve(
                    worker_id,
                    registry,
                    FrameReader::new(request_read),
                    FrameWriter::new(response_write),
                )
            }));
            if served.is_err() {
                error!(worker_id, "Worker setup panicked");
            }
            std::process::exit(EXIT_SETUP_PANICKED)
        }
        ForkResult::Parent { child } => {
            drop(request_read);
            drop(response_write);
            debug!(worker_id, pid = child.as_raw(), "Spawned worker");
            Ok(Worker::new(
                worker_id,
                child,
                Channels {
                    requests: FrameWriter::new(request_write),
                    responses: FrameReader::new(response_read),
                },
            ))
        }
    }
}
