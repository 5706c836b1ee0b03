//! Built-in jobs for the command-line demo.

use forkpool::worker::{Exhaustion, JobKind, JobRegistry};

use crate::cli::DemoJob;

/// Registered kinds of the built-in jobs.
pub struct DemoJobs {
    square: JobKind<u64, u64>,
    fail: JobKind<u64, u64>,
    crash: JobKind<u64, u64>,
    exhaust: JobKind<u64, u64>,
}

impl DemoJobs {
    /// Register every built-in job.
    pub fn register(registry: &mut JobRegistry) -> Self {
        Self {
            square: registry.register("square", |x: u64| Ok(x.wrapping_mul(x))),
            fail: registry.register("fail", |x: u64| Ok(x / std::hint::black_box(0))),
            crash: registry.register("crash", |_: u64| -> anyhow::Result<u64> {
                std::process::abort()
            }),
            exhaust: registry.register("exhaust", |_: u64| -> anyhow::Result<u64> {
                Err(Exhaustion::HeapFull.into())
            }),
        }
    }

    pub fn kind(&self, job: DemoJob) -> &JobKind<u64, u64> {
        match job {
            DemoJob::Square => &self.square,
            DemoJob::Fail => &self.fail,
            DemoJob::Crash => &self.crash,
            DemoJob::Exhaust => &self.exhaust,
        }
    }
}

/// One-line description of a built-in job.
pub fn describe(job: DemoJob) -> &'static str {
    match job {
        DemoJob::Square => "returns the input squared",
        DemoJob::Fail => "divides by zero; reported as a job failure",
        DemoJob::Crash => "aborts its process; reported as an abnormal termination",
        DemoJob::Exhaust => "reports a full shared heap; reported as resource exhaustion",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_every_job_is_registered() {
        let mut registry = JobRegistry::new();
        let jobs = DemoJobs::register(&mut registry);
        for job in DemoJob::value_variants() {
            let kind = jobs.kind(*job);
            assert!(registry.contains(kind.name()));
            assert!(!describe(*job).is_empty());
        }
        assert_eq!(registry.len(), DemoJob::value_variants().len());
    }
}
