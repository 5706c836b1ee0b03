//! A minimal scheduler on top of the worker primitives.
//!
//! Across workers there is no ordering guarantee, so results are tagged with
//! their submission index and put back in order at the end. There are no
//! retries: a job whose worker dies reports that fault, and the dead worker
//! is killed so it is not offered more work.

use std::collections::VecDeque;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::error::{Result, Unavailable, WorkerError};
use crate::worker::{Handle, Job, Worker, call, select};

/// Run `jobs` on `workers` and return one outcome per job, in submission
/// order.
///
/// Jobs still queued once no worker can take them (every worker killed or
/// left busy) fail with [`Unavailable::NoIdleWorker`].
///
/// Expects the workers to be idle and not driven by anyone else meanwhile.
/// The outer error is reserved for failures of the polling itself; job and
/// worker faults are reported per job.
#[instrument(level = "debug", skip_all, fields(workers = workers.len()))]
pub fn run_ordered<A, R, I>(workers: &[Worker], jobs: I) -> Result<Vec<Result<R>>>
where
    A: Serialize,
    R: Clone + DeserializeOwned,
    I: IntoIterator<Item = Job<A, R>>,
{
    let mut queue: VecDeque<(usize, Job<A, R>)> = jobs.into_iter().enumerate().collect();
    let mut results: Vec<Option<Result<R>>> = (0..queue.len()).map(|_| None).collect();
    let mut in_flight: Vec<(usize, Handle<R>)> = Vec::new();

    loop {
        feed(workers, &mut queue, &mut in_flight, &mut results);

        if in_flight.is_empty() {
            let killed = workers.iter().filter(|w| w.is_killed()).count();
            let reason = Unavailable::NoIdleWorker {
                killed,
                busy: workers.len() - killed,
            };
            if !queue.is_empty() {
                warn!(remaining = queue.len(), %reason, "Queued jobs cannot be placed");
            }
            for (index, _) in queue.drain(..) {
                results[index] = Some(Err(reason.into()));
            }
            break;
        }

        let ready: Vec<*const Handle<R>> = select(in_flight.iter().map(|(_, h)| h))?
            .ready
            .into_iter()
            .map(|h| h as *const Handle<R>)
            .collect();

        let (done, pending): (Vec<_>, Vec<_>) = in_flight
            .into_iter()
            .partition(|(_, h)| ready.contains(&(h as *const Handle<R>)));
        in_flight = pending;

        for (index, handle) in done {
            let worker = handle.worker();
            let result = handle.get_result();
            if let Err(e) = &result
                && e.is_worker_lost()
                && let Some(worker) = worker
            {
                debug!(worker_id = worker.id(), error = %e, "Retiring lost worker");
                worker.kill();
            }
            results[index] = Some(result);
        }
    }

    Ok(results
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| Err(WorkerError::Protocol("job result was never read".into())))
        })
        .collect())
}

/// Hand queued jobs to every idle worker.
fn feed<A, R>(
    workers: &[Worker],
    queue: &mut VecDeque<(usize, Job<A, R>)>,
    in_flight: &mut Vec<(usize, Handle<R>)>,
    results: &mut [Option<Result<R>>],
) where
    A: Serialize,
{
    for worker in workers {
        if worker.is_busy() || worker.is_killed() {
            continue;
        }
        let Some((index, job)) = queue.pop_front() else {
            return;
        };
        match call(worker, job) {
            Ok(handle) => in_flight.push((index, handle)),
            Err(e) => {
                if e.is_worker_lost() {
                    worker.kill();
                }
                results[index] = Some(Err(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::JobRegistry;

    #[test]
    fn test_no_workers_fails_every_job() {
        let mut registry = JobRegistry::new();
        let double = registry.register("double", |x: u32| Ok(x * 2));

        let results = run_ordered(&[], (0..3).map(|x| double.job(x))).unwrap();
        assert_eq!(results.len(), 3);
        for result in results {
            assert!(matches!(
                result,
                Err(WorkerError::Unavailable(Unavailable::NoIdleWorker {
                    killed: 0,
                    busy: 0
                }))
            ));
        }
    }

    #[test]
    fn test_no_jobs() {
        let results: Vec<Result<u8>> =
            run_ordered(&[], std::iter::empty::<Job<u8, u8>>()).unwrap();
        assert!(results.is_empty());
    }
}
