//! Exit-status contract and crash analysis for worker processes.
//!
//! Ephemeral workers report resource exhaustion through reserved exit
//! statuses instead of a response frame, and persistent workers propagate
//! those statuses (and fatal signals) as their own. The tables here are the
//! single place where a `WaitStatus` turns into a failure category.

use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use thiserror::Error;

use crate::error::WorkerError;

/// The job finished; its outcome is in the response payload.
pub const EXIT_COMPLETED: i32 = 0;

/// The worker's request channel was closed.
pub const EXIT_CHANNEL_CLOSED: i32 = 1;

pub const EXIT_OUT_OF_SHARED_MEMORY: i32 = 15;
pub const EXIT_HASH_TABLE_FULL: i32 = 16;
pub const EXIT_HEAP_FULL: i32 = 17;

/// First of the statuses reserved for storage consistency failures.
pub const EXIT_STORAGE_FAILURE_BASE: i32 = 18;

/// Number of storage consistency sub-codes (`18..=23`).
pub const STORAGE_FAILURE_CODES: u8 = 6;

/// Status a shell reports for a child killed by SIGKILL. Only a fallback
/// for out-of-memory detection; the signal itself is canonical.
const EXIT_KILLED_BY_SIGKILL: i32 = 128 + Signal::SIGKILL as i32;

/// Exhaustion of the shared memory region, detected inside a job.
///
/// Jobs signal these by returning them as errors, raising them with
/// [`Exhaustion::raise`], or calling [`Exhaustion::exit`] directly. In every
/// case the ephemeral worker exits with the matching reserved status without
/// trying to serialize a response.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    #[error("shared memory region is out of space")]
    OutOfSharedMemory,

    #[error("shared hash table is full")]
    HashTableFull,

    #[error("shared heap is full")]
    HeapFull,

    #[error("shared storage consistency check failed (sub-code {0})")]
    StorageConsistency(u8),
}

impl Exhaustion {
    /// The reserved exit status for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::OutOfSharedMemory => EXIT_OUT_OF_SHARED_MEMORY,
            Self::HashTableFull => EXIT_HASH_TABLE_FULL,
            Self::HeapFull => EXIT_HEAP_FULL,
            Self::StorageConsistency(sub_code) => {
                EXIT_STORAGE_FAILURE_BASE + i32::from(sub_code.min(STORAGE_FAILURE_CODES - 1))
            }
        }
    }

    /// Map a reserved exit status back to its category.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            EXIT_OUT_OF_SHARED_MEMORY => Some(Self::OutOfSharedMemory),
            EXIT_HASH_TABLE_FULL => Some(Self::HashTableFull),
            EXIT_HEAP_FULL => Some(Self::HeapFull),
            c if (EXIT_STORAGE_FAILURE_BASE
                ..EXIT_STORAGE_FAILURE_BASE + i32::from(STORAGE_FAILURE_CODES))
                .contains(&c) =>
            {
                Some(Self::StorageConsistency((c - EXIT_STORAGE_FAILURE_BASE) as u8))
            }
            _ => None,
        }
    }

    /// Terminate the current process with the reserved status.
    pub fn exit(self) -> ! {
        std::process::exit(self.exit_code())
    }

    /// Unwind out of the running job; the ephemeral worker turns the panic
    /// payload into the reserved exit status.
    pub fn raise(self) -> ! {
        std::panic::panic_any(self)
    }
}

/// How a worker process ended, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ProcessStatus {
    /// Extract the terminal status from a `WaitStatus`, if it is one.
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(Self::Signaled(signal)),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
        }
    }
}

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Clean exit; the job outcome travelled in the response.
    Completed,
    /// The request channel reached end-of-stream.
    ChannelClosed,
    /// A reserved resource-exhaustion status.
    Exhausted(Exhaustion),
    /// SIGKILL, most likely from the kernel OOM killer.
    OutOfMemory,
    /// Killed by any other signal.
    Signaled(Signal),
    /// Any other exit status.
    Exited(i32),
    /// Process is still running.
    StillAlive,
    /// Stopped, continued or traced; not a termination.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::ChannelClosed => "request channel closed".to_string(),
            Self::Exhausted(kind) => kind.to_string(),
            Self::OutOfMemory => "out of memory (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Exited(code) => format!("exited with code {}", code),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }

    /// Translate a terminal status into the fault a caller sees.
    ///
    /// Returns `None` while the process is still alive, in which case the
    /// caller should keep whatever I/O error it already has.
    pub fn into_error(self, worker: usize, status: WaitStatus) -> Option<WorkerError> {
        match self {
            Self::StillAlive | Self::Unknown => None,
            Self::Exhausted(kind) => Some(WorkerError::Exhausted(kind)),
            Self::OutOfMemory => Some(WorkerError::OutOfMemory { worker }),
            Self::Completed | Self::ChannelClosed | Self::Signaled(_) | Self::Exited(_) => {
                ProcessStatus::from_wait_status(status)
                    .map(|status| WorkerError::AbnormalTermination { worker, status })
            }
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, EXIT_COMPLETED) => TerminationReason::Completed,
        WaitStatus::Exited(_, EXIT_CHANNEL_CLOSED) => TerminationReason::ChannelClosed,
        WaitStatus::Exited(_, EXIT_KILLED_BY_SIGKILL) => TerminationReason::OutOfMemory,
        WaitStatus::Exited(_, code) => match Exhaustion::from_exit_code(code) {
            Some(kind) => TerminationReason::Exhausted(kind),
            None => TerminationReason::Exited(code),
        },

        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::OutOfMemory,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),

        WaitStatus::StillAlive => TerminationReason::StillAlive,

        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn exited(code: i32) -> WaitStatus {
        WaitStatus::Exited(Pid::from_raw(1), code)
    }

    fn signaled(signal: Signal) -> WaitStatus {
        WaitStatus::Signaled(Pid::from_raw(1), signal, false)
    }

    #[test]
    fn test_exit_code_table() {
        assert_eq!(analyze_wait_status(exited(0)), TerminationReason::Completed);
        assert_eq!(
            analyze_wait_status(exited(1)),
            TerminationReason::ChannelClosed
        );
        assert_eq!(
            analyze_wait_status(exited(15)),
            TerminationReason::Exhausted(Exhaustion::OutOfSharedMemory)
        );
        assert_eq!(
            analyze_wait_status(exited(16)),
            TerminationReason::Exhausted(Exhaustion::HashTableFull)
        );
        assert_eq!(
            analyze_wait_status(exited(17)),
            TerminationReason::Exhausted(Exhaustion::HeapFull)
        );
        assert_eq!(
            analyze_wait_status(exited(20)),
            TerminationReason::Exhausted(Exhaustion::StorageConsistency(2))
        );
        assert_eq!(analyze_wait_status(exited(24)), TerminationReason::Exited(24));
        assert_eq!(analyze_wait_status(exited(3)), TerminationReason::Exited(3));
    }

    #[test]
    fn test_signal_table() {
        assert_eq!(
            analyze_wait_status(signaled(Signal::SIGKILL)),
            TerminationReason::OutOfMemory
        );
        assert_eq!(
            analyze_wait_status(signaled(Signal::SIGSEGV)),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_oom_exit_status_fallback() {
        assert_eq!(
            analyze_wait_status(exited(137)),
            TerminationReason::OutOfMemory
        );
    }

    #[test]
    fn test_exhaustion_exit_code_roundtrip() {
        let kinds = [
            Exhaustion::OutOfSharedMemory,
            Exhaustion::HashTableFull,
            Exhaustion::HeapFull,
            Exhaustion::StorageConsistency(0),
            Exhaustion::StorageConsistency(5),
        ];
        for kind in kinds {
            assert_eq!(Exhaustion::from_exit_code(kind.exit_code()), Some(kind));
        }
        assert_eq!(Exhaustion::from_exit_code(0), None);
        assert_eq!(Exhaustion::from_exit_code(1), None);
    }

    #[test]
    fn test_storage_sub_code_is_clamped() {
        assert_eq!(Exhaustion::StorageConsistency(200).exit_code(), 23);
    }

    #[test]
    fn test_into_error() {
        let status = exited(16);
        let err = analyze_wait_status(status).into_error(4, status).unwrap();
        assert!(matches!(
            err,
            WorkerError::Exhausted(Exhaustion::HashTableFull)
        ));

        let status = signaled(Signal::SIGKILL);
        let err = analyze_wait_status(status).into_error(4, status).unwrap();
        assert!(matches!(err, WorkerError::OutOfMemory { worker: 4 }));

        let status = signaled(Signal::SIGABRT);
        let err = analyze_wait_status(status).into_error(4, status).unwrap();
        assert!(matches!(
            err,
            WorkerError::AbnormalTermination {
                worker: 4,
                status: ProcessStatus::Signaled(Signal::SIGABRT)
            }
        ));

        let status = exited(0);
        let err = analyze_wait_status(status).into_error(4, status).unwrap();
        assert!(matches!(
            err,
            WorkerError::AbnormalTermination {
                status: ProcessStatus::Exited(0),
                ..
            }
        ));

        let status = WaitStatus::StillAlive;
        assert!(analyze_wait_status(status).into_error(4, status).is_none());
    }

    #[test]
    fn test_description() {
        assert!(
            TerminationReason::OutOfMemory
                .to_string()
                .contains("out of memory")
        );
        assert!(
            TerminationReason::Exhausted(Exhaustion::HeapFull)
                .to_string()
                .contains("heap")
        );
        assert!(TerminationReason::Completed.is_success());
        assert!(!TerminationReason::Exited(2).is_success());
    }
}
