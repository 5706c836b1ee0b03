//! Persistent worker loop.
//!
//! Each pool slot is a long-lived process that waits for a request, forks an
//! ephemeral worker to handle it, and reaps that child before waiting again.
//! The persistent worker never reads a request itself; the ephemeral child
//! consumes it from the shared pipe.
//!
//! When the child ends in anything other than a clean exit, the persistent
//! worker terminates the same way (same exit code, same signal). The caller
//! only ever waits on persistent workers, so this is how the failure
//! category reaches it.

use std::io::Write;
use std::os::unix::io::AsFd;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::{debug, error, trace};

use super::ephemeral;
use super::ipc::{FrameReader, FrameWriter};
use super::job::JobRegistry;
use super::signals::{EXIT_CHANNEL_CLOSED, TerminationReason, analyze_wait_status};

/// Exit status when the ephemeral worker could not be forked.
const EXIT_FORK_FAILED: i32 = 2;

/// Serve requests until the request channel closes or a job kills us.
pub(crate) fn serve(
    worker_id: usize,
    registry: &JobRegistry,
    mut reader: FrameReader,
    mut writer: FrameWriter,
) -> ! {
    debug!(worker_id, pid = std::process::id(), "Worker serving");

    loop {
        match wait_for_request(&reader) {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker_id, "Request channel closed, exiting");
                std::process::exit(EXIT_CHANNEL_CLOSED);
            }
            Err(e) => {
                error!(worker_id, error = %e, "Polling request channel failed");
                std::process::exit(EXIT_CHANNEL_CLOSED);
            }
        }

        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();

        // Safety: the child only runs the ephemeral worker and then exits.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => ephemeral::run(registry, &mut reader, &mut writer),
            Ok(ForkResult::Parent { child }) => {
                let status = match reap(child) {
                    Ok(status) => status,
                    Err(e) => {
                        error!(worker_id, error = %e, "Failed to reap ephemeral worker");
                        std::process::exit(EXIT_FORK_FAILED);
                    }
                };
                let reason = analyze_wait_status(status);
                trace!(worker_id, child = child.as_raw(), %reason, "Ephemeral worker reaped");
                propagate(worker_id, reason);
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to fork ephemeral worker");
                std::process::exit(EXIT_FORK_FAILED);
            }
        }
    }
}

/// Block until the request channel is readable.
///
/// Returns `false` once the channel has hung up with nothing left to read.
fn wait_for_request(reader: &FrameReader) -> nix::Result<bool> {
    loop {
        let mut fds = [PollFd::new(reader.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLIN) {
            return Ok(true);
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
            return Ok(false);
        }
    }
}

/// Blocking `waitpid`, retried across interrupted waits.
pub(crate) fn reap(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => return Ok(status),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Continue serving after a clean exit; otherwise end this process the same
/// way the ephemeral worker ended.
fn propagate(worker_id: usize, reason: TerminationReason) {
    match reason {
        TerminationReason::Completed
        | TerminationReason::StillAlive
        | TerminationReason::Unknown => {}
        TerminationReason::ChannelClosed => {
            debug!(worker_id, "Ephemeral worker saw a closed channel, exiting");
            std::process::exit(EXIT_CHANNEL_CLOSED);
        }
        TerminationReason::Exhausted(kind) => {
            error!(worker_id, reason = %kind, "Shared resource exhausted, exiting");
            std::process::exit(kind.exit_code());
        }
        TerminationReason::Exited(code) => {
            error!(worker_id, code, "Ephemeral worker exited unexpectedly");
            std::process::exit(code);
        }
        TerminationReason::OutOfMemory => {
            error!(worker_id, "Ephemeral worker was killed, likely out of memory");
            die_by(Signal::SIGKILL);
        }
        TerminationReason::Signaled(sig) => {
            error!(worker_id, signal = ?sig, "Ephemeral worker was killed by a signal");
            die_by(sig);
        }
    }
}

/// Terminate this process with `sig`, falling back to the shell convention
/// `128 + sig` if the signal does not take effect.
fn die_by(sig: Signal) -> ! {
    // Safety: restoring the default disposition has no handler to race with.
    unsafe {
        let _ = signal::signal(sig, SigHandler::SigDfl);
    }
    let _ = signal::raise(sig);
    std::process::exit(128 + sig as i32)
}
