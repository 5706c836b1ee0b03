//! Readiness multiplexing across many handles.
//!
//! [`select`] partitions handles into those whose `get_result` would return
//! without blocking and those still waiting, using a single `poll(2)` over
//! the workers' response pipes. A scheduler can loop on it to harvest
//! finished jobs and refill idle workers.

use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::trace;

use super::handle::{Handle, HandleState};
use super::proc::Worker;
use crate::error::Result;

/// Result of [`select`]: every input handle lands in exactly one list, in
/// input order.
#[derive(Debug)]
pub struct Selected<'a, R> {
    /// Handles whose result can be read without blocking.
    pub ready: Vec<&'a Handle<R>>,
    /// Handles still waiting on their worker.
    pub waiting: Vec<&'a Handle<R>>,
}

/// Partition `handles` into ready and waiting.
///
/// Terminal handles are always ready. A handle listed more than once appears
/// once per listing, always in the same list. If no handle is ready yet, blocks
/// until at least one worker has something to report.
pub fn select<'a, R, I>(handles: I) -> Result<Selected<'a, R>>
where
    I: IntoIterator<Item = &'a Handle<R>>,
    R: 'a,
{
    select_with(handles, PollTimeout::NONE)
}

/// Like [`select`], but blocks for at most `timeout`.
pub fn select_timeout<'a, R, I>(handles: I, timeout: Duration) -> Result<Selected<'a, R>>
where
    I: IntoIterator<Item = &'a Handle<R>>,
    R: 'a,
{
    let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
    select_with(handles, timeout)
}

/// Per-handle classification before polling.
enum Probe {
    Ready,
    Waiting,
    Poll(Worker),
}

fn probe<R>(handle: &Handle<R>) -> Probe {
    // Locked handles are being read by another thread.
    let Some(state) = handle.try_state() else {
        return Probe::Waiting;
    };
    match &*state {
        HandleState::Processing { worker } if worker.is_killed() => Probe::Ready,
        HandleState::Processing { worker } => Probe::Poll(worker.clone()),
        _ => Probe::Ready,
    }
}

fn select_with<'a, R, I>(handles: I, block: PollTimeout) -> Result<Selected<'a, R>>
where
    I: IntoIterator<Item = &'a Handle<R>>,
    R: 'a,
{
    let handles: Vec<&'a Handle<R>> = handles.into_iter().collect();
    let mut ready = vec![false; handles.len()];
    let mut pending: Vec<(usize, Worker)> = Vec::new();

    // A handle passed more than once is probed once, at its first position.
    let mut first_seen: HashMap<*const Handle<R>, usize> = HashMap::new();
    let canonical: Vec<usize> = handles
        .iter()
        .enumerate()
        .map(|(index, handle)| *first_seen.entry(*handle as *const Handle<R>).or_insert(index))
        .collect();

    for (index, handle) in handles.iter().enumerate() {
        if canonical[index] != index {
            continue;
        }
        match probe(*handle) {
            Probe::Ready => ready[index] = true,
            Probe::Waiting => {}
            Probe::Poll(worker) => pending.push((index, worker)),
        }
    }

    {
        let mut guards = Vec::with_capacity(pending.len());
        for (index, worker) in &pending {
            let Some(guard) = worker.try_channels() else {
                continue;
            };
            if guard.is_none() {
                // Channels already closed by kill.
                ready[*index] = true;
                continue;
            }
            guards.push((*index, guard));
        }

        let mut indices = Vec::with_capacity(guards.len());
        let mut fds = Vec::with_capacity(guards.len());
        for (index, guard) in &guards {
            if let Some(channels) = guard.as_ref() {
                indices.push(*index);
                fds.push(PollFd::new(channels.responses.as_fd(), PollFlags::POLLIN));
            }
        }

        if !fds.is_empty() {
            let timeout = if ready.iter().any(|r| *r) {
                PollTimeout::ZERO
            } else {
                block
            };
            poll_retrying(&mut fds, timeout)?;

            let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            for (fd, index) in fds.iter().zip(&indices) {
                if fd.revents().is_some_and(|r| r.intersects(readable)) {
                    ready[*index] = true;
                }
            }
        }
    }

    for (index, first) in canonical.iter().enumerate() {
        ready[index] = ready[*first];
    }

    let mut selected = Selected {
        ready: Vec::new(),
        waiting: Vec::new(),
    };
    for (handle, is_ready) in handles.into_iter().zip(ready) {
        if is_ready {
            selected.ready.push(handle);
        } else {
            selected.waiting.push(handle);
        }
    }
    trace!(
        ready = selected.ready.len(),
        waiting = selected.waiting.len(),
        "Selected handles"
    );
    Ok(selected)
}

fn poll_retrying(fds: &mut [PollFd<'_>], timeout: PollTimeout) -> Result<()> {
    loop {
        match poll(fds, timeout) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
