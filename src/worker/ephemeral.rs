//! Ephemeral worker: one request, one job, one exit.
//!
//! Forked by the persistent worker for every request. Whatever the job
//! allocates is returned to the system when this process exits, so memory
//! growth never accumulates across jobs.
//!
//! The exit status is part of the protocol (see [`super::signals`]): `0`
//! means the outcome travelled in a response frame, `1` means the request
//! channel was closed, and the reserved exhaustion codes bypass the response
//! entirely.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, warn};

use super::ipc::{FrameReader, FrameWriter};
use super::job::{JobRegistry, RawResponder};
use super::protocol::{Request, Response};
use super::signals::{EXIT_CHANNEL_CLOSED, EXIT_COMPLETED, Exhaustion};
use crate::error::WorkerError;
use crate::metrics::ProcessClock;

thread_local! {
    /// Location and backtrace of the most recent panic on this thread.
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// How the ephemeral worker ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Completed,
    ChannelClosed,
    Exhausted(Exhaustion),
}

impl Exit {
    fn code(self) -> i32 {
        match self {
            Self::Completed => EXIT_COMPLETED,
            Self::ChannelClosed => EXIT_CHANNEL_CLOSED,
            Self::Exhausted(kind) => kind.exit_code(),
        }
    }
}

/// Run exactly one job from `reader`, answer on `writer` and exit.
pub(crate) fn run(registry: &JobRegistry, reader: &mut FrameReader, writer: &mut FrameWriter) -> ! {
    set_parent_death_signal();
    install_panic_hook();

    let exit = execute(registry, reader, writer);
    if let Exit::Exhausted(kind) = exit {
        debug!(reason = %kind, "Job exhausted a shared resource");
    }
    std::process::exit(exit.code())
}

/// Die with the persistent worker instead of outliving it.
#[cfg(target_os = "linux")]
fn set_parent_death_signal() {
    if let Err(e) = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL) {
        warn!(error = %e, "Failed to set parent death signal");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal() {}

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        // Exhaustion is a control-flow panic, not a bug.
        if info.payload().downcast_ref::<Exhaustion>().is_some() {
            return;
        }
        let location = info
            .location()
            .map(|l| format!("panicked at {}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "panicked".to_string());
        let backtrace = Backtrace::force_capture();
        LAST_PANIC.with(|slot| {
            *slot.borrow_mut() = Some(format!("{}\n{}", location, backtrace));
        });
    }));
}

fn take_panic_backtrace() -> String {
    LAST_PANIC
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked with a non-string payload".to_string()
    }
}

/// Find an exhaustion condition anywhere in an error chain.
fn exhaustion_in(err: &anyhow::Error) -> Option<Exhaustion> {
    err.chain().find_map(|cause| {
        if let Some(kind) = cause.downcast_ref::<Exhaustion>() {
            return Some(*kind);
        }
        match cause.downcast_ref::<WorkerError>() {
            Some(WorkerError::Exhausted(kind)) => Some(*kind),
            _ => None,
        }
    })
}

fn error_backtrace(err: &anyhow::Error) -> String {
    let backtrace = err.backtrace();
    match backtrace.status() {
        BacktraceStatus::Captured => backtrace.to_string(),
        _ => String::new(),
    }
}

fn send_failure(writer: &mut FrameWriter, message: &str, backtrace: &str) {
    let sent = Response::<()>::failure(message, backtrace)
        .encode()
        .and_then(|frame| writer.write_frame(&frame).map_err(WorkerError::from));
    if let Err(e) = sent {
        warn!(error = %e, "Failed to send failure response");
    }
}

fn execute(registry: &JobRegistry, reader: &mut FrameReader, writer: &mut FrameWriter) -> Exit {
    let frame = match reader.read_frame() {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("Request channel closed");
            return Exit::ChannelClosed;
        }
        Err(e) => {
            warn!(error = %e, "Failed to read request");
            return Exit::ChannelClosed;
        }
    };

    let request = match Request::decode(&frame) {
        Ok(request) => request,
        Err(e) => {
            send_failure(writer, &e.to_string(), "");
            return Exit::Completed;
        }
    };

    let clock = ProcessClock::start();

    let Some(job) = registry.get(&request.kind) else {
        send_failure(writer, &format!("unknown job kind '{}'", request.kind), "");
        return Exit::Completed;
    };

    let mut responded = false;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        job(
            &request,
            RawResponder {
                writer: &mut *writer,
                clock: &clock,
                responded: &mut responded,
            },
        )
    }));

    let (message, backtrace) = match outcome {
        Ok(Ok(())) if responded => return Exit::Completed,
        Ok(Ok(())) => ("job returned without responding".to_string(), String::new()),
        Ok(Err(err)) => {
            if let Some(kind) = exhaustion_in(&err) {
                return Exit::Exhausted(kind);
            }
            (format!("{:#}", err), error_backtrace(&err))
        }
        Err(payload) => {
            if let Some(kind) = payload.downcast_ref::<Exhaustion>() {
                return Exit::Exhausted(*kind);
            }
            (panic_message(payload.as_ref()), take_panic_backtrace())
        }
    };

    if responded {
        warn!(job = %request.kind, error = %message, "Job failed after responding");
    } else {
        send_failure(writer, &message, &backtrace);
    }
    Exit::Completed
}
