//! Caller-side handle to a persistent worker process.
//!
//! A [`Worker`] owns the parent ends of the worker's two pipes and tracks
//! whether it is running a job (`busy`) or has been torn down (`killed`).
//! Clones share the same process; the process is killed when the last clone
//! is dropped.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::ipc::{FrameReader, FrameWriter};
use super::persistent::reap;
use super::signals::{ProcessStatus, analyze_wait_status};
use crate::error::{Unavailable, WorkerError};

/// Parent ends of a worker's pipes.
#[derive(Debug)]
pub(crate) struct Channels {
    /// Requests to the worker.
    pub(crate) requests: FrameWriter,
    /// Responses from the worker.
    pub(crate) responses: FrameReader,
}

struct WorkerInner {
    id: usize,
    pid: Pid,
    channels: Mutex<Option<Channels>>,
    busy: AtomicBool,
    killed: AtomicBool,
    /// Terminal status, once collected. Also serializes reaping so the
    /// process is waited for exactly once.
    exit_status: Mutex<Option<WaitStatus>>,
}

/// Handle to one persistent worker process.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Worker {
    pub(crate) fn new(id: usize, pid: Pid, channels: Channels) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                id,
                pid,
                channels: Mutex::new(Some(channels)),
                busy: AtomicBool::new(false),
                killed: AtomicBool::new(false),
                exit_status: Mutex::new(None),
            }),
        }
    }

    /// Position of this worker in the pool it was created with.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Process ID of the persistent worker.
    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// Whether a submitted job has not been read back yet.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::Acquire)
    }

    /// Close the worker's channels, kill the process and reap it.
    ///
    /// Idempotent. A job in flight is lost; reading its handle afterwards
    /// reports an abnormal termination.
    pub fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.kill_and_reap();
    }

    /// Claim the worker for a new job.
    pub(crate) fn acquire(&self) -> Result<(), Unavailable> {
        if self.is_killed() {
            return Err(Unavailable::Killed(self.id()));
        }
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Unavailable::Busy(self.id()))
    }

    pub(crate) fn release(&self) {
        self.inner.busy.store(false, Ordering::Release);
    }

    pub(crate) fn channels(&self) -> MutexGuard<'_, Option<Channels>> {
        lock(&self.inner.channels)
    }

    /// Like [`Worker::channels`], but gives up if another thread is using
    /// them.
    pub(crate) fn try_channels(&self) -> Option<MutexGuard<'_, Option<Channels>>> {
        match self.inner.channels.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Drop this process's copy of the pipes without touching the worker.
    ///
    /// Used in freshly forked siblings, which must not hold each other's
    /// channels open.
    pub(crate) fn close_channels(&self) {
        lock(&self.inner.channels).take();
    }

    /// Terminal status of the worker process, collecting it if needed.
    ///
    /// Returns `None` while the process is running. `blocking` waits for the
    /// process to exit; use it only when the process is known to be going
    /// away (its pipes reached end-of-stream).
    pub(crate) fn wait_status(&self, blocking: bool) -> Option<WaitStatus> {
        self.inner.collect_status(blocking)
    }

    /// The typed fault explaining why the worker is gone, or `None` if it is
    /// still running.
    pub(crate) fn fault(&self, blocking: bool) -> Option<WorkerError> {
        let status = self.wait_status(blocking)?;
        analyze_wait_status(status).into_error(self.id(), status)
    }

    /// Fault reported for jobs that were in flight when the worker was killed.
    pub(crate) fn killed_fault(&self) -> WorkerError {
        let status = self
            .wait_status(false)
            .and_then(ProcessStatus::from_wait_status)
            .unwrap_or(ProcessStatus::Signaled(Signal::SIGKILL));
        WorkerError::AbnormalTermination {
            worker: self.id(),
            status,
        }
    }
}

impl WorkerInner {
    fn kill_and_reap(&self) {
        // A reader blocked on the response pipe holds the lock; its ends are
        // closed once the signal has ended that read.
        if let Ok(mut channels) = self.channels.try_lock() {
            channels.take();
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(worker_id = self.id, error = %e, "Failed to send SIGKILL"),
        }
        let status = self.collect_status(true);
        lock(&self.channels).take();
        debug!(worker_id = self.id, pid = self.pid.as_raw(), ?status, "Worker killed");
    }

    fn collect_status(&self, blocking: bool) -> Option<WaitStatus> {
        let mut recorded = lock(&self.exit_status);
        if let Some(status) = *recorded {
            return Some(status);
        }

        let result = if blocking {
            reap(self.pid)
        } else {
            loop {
                match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                    Err(Errno::EINTR) => continue,
                    other => break other,
                }
            }
        };

        match result {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                *recorded = Some(status);
                Some(status)
            }
            Ok(_) => None,
            Err(Errno::ECHILD) => {
                // Reaped outside our control; the exit status is lost.
                warn!(worker_id = self.id, "Worker was already reaped");
                let status = WaitStatus::Signaled(self.pid, Signal::SIGKILL, false);
                *recorded = Some(status);
                Some(status)
            }
            Err(e) => {
                warn!(worker_id = self.id, error = %e, "waitpid failed");
                None
            }
        }
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            self.kill_and_reap();
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("pid", &self.pid())
            .field("busy", &self.is_busy())
            .field("killed", &self.is_killed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ipc::pipe;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    /// A `Worker` around an unrelated child process.
    fn worker_for(mut child: std::process::Child) -> Worker {
        let pid = Pid::from_raw(child.id() as i32);
        // The Worker takes over reaping.
        drop(child.stdin.take());
        std::mem::forget(child);

        let (_, request_write) = pipe().unwrap();
        let (response_read, _) = pipe().unwrap();
        Worker::new(
            7,
            pid,
            Channels {
                requests: FrameWriter::new(request_write),
                responses: FrameReader::new(response_read),
            },
        )
    }

    fn sleeper() -> Worker {
        let child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .spawn()
            .expect("Failed to spawn sleep");
        worker_for(child)
    }

    #[test]
    fn test_acquire_release() {
        let worker = sleeper();
        assert!(!worker.is_busy());
        worker.acquire().unwrap();
        assert!(worker.is_busy());
        assert_eq!(worker.acquire(), Err(Unavailable::Busy(7)));
        worker.release();
        assert!(worker.acquire().is_ok());
        worker.kill();
    }

    #[test]
    fn test_kill_is_idempotent() {
        let worker = sleeper();
        assert!(worker.wait_status(false).is_none());

        worker.kill();
        assert!(worker.is_killed());
        assert!(worker.channels().is_none());
        let status = worker.wait_status(false);
        assert!(matches!(
            status,
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        ));

        worker.kill();
        assert_eq!(worker.wait_status(false), status);
        assert_eq!(worker.acquire(), Err(Unavailable::Killed(7)));
    }

    #[test]
    fn test_killed_fault_is_abnormal_termination() {
        let worker = sleeper();
        worker.kill();
        assert!(matches!(
            worker.killed_fault(),
            WorkerError::AbnormalTermination {
                worker: 7,
                status: ProcessStatus::Signaled(Signal::SIGKILL)
            }
        ));
    }

    #[test]
    fn test_fault_for_exited_process() {
        let child = Command::new("sh")
            .args(["-c", "exit 16"])
            .stdin(Stdio::null())
            .spawn()
            .expect("Failed to spawn sh");
        let worker = worker_for(child);

        let fault = worker.fault(true);
        assert!(matches!(fault, Some(WorkerError::Exhausted(_))));
        worker.kill();
    }

    #[test]
    fn test_fault_for_running_process() {
        let worker = sleeper();
        std::thread::sleep(Duration::from_millis(10));
        assert!(worker.fault(false).is_none());
        worker.kill();
    }

    #[test]
    fn test_drop_kills() {
        let worker = sleeper();
        let pid = worker.pid();
        drop(worker);
        // Reaped: the pid is no longer our child.
        assert_eq!(
            waitpid(pid, Some(WaitPidFlag::WNOHANG)),
            Err(Errno::ECHILD)
        );
    }
}
