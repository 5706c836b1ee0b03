//! Per-job timing samples and process-wide job metrics.
//!
//! Ephemeral workers sample their own CPU and wall time around each job and
//! ship the difference back in the response. The caller merges every sample
//! into a process-wide [`JobMetrics`] when the result is read.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::sys::resource::{Usage, UsageWho, getrusage};
use nix::sys::time::TimeVal;
use serde::{Deserialize, Serialize};

/// Resource usage of a single job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSample {
    /// Wall-clock time between job start and response.
    pub wall: Duration,
    /// User CPU time consumed by the job.
    pub user_cpu: Duration,
    /// System CPU time consumed by the job.
    pub system_cpu: Duration,
    /// Peak resident set size of the executing process, in KiB.
    pub max_rss_kib: u64,
}

impl TimingSample {
    /// Total CPU time (user + system).
    pub fn cpu(&self) -> Duration {
        self.user_cpu + self.system_cpu
    }
}

fn timeval_to_duration(tv: TimeVal) -> Duration {
    Duration::from_secs(tv.tv_sec().max(0) as u64)
        + Duration::from_micros(tv.tv_usec().max(0) as u64)
}

/// Peak RSS in KiB from a `getrusage` result.
fn max_rss_kib(usage: &Usage) -> u64 {
    let max_rss = usage.max_rss().max(0) as u64;

    #[cfg(target_os = "macos")]
    {
        // macOS: max_rss is in bytes
        max_rss / 1024
    }

    #[cfg(not(target_os = "macos"))]
    {
        // Linux: max_rss is in kilobytes
        max_rss
    }
}

/// CPU and wall clock snapshot taken before a job runs.
#[derive(Debug, Clone, Copy)]
pub struct ProcessClock {
    started: Instant,
    user_cpu: Duration,
    system_cpu: Duration,
}

impl ProcessClock {
    /// Sample the current process.
    pub fn start() -> Self {
        let (user_cpu, system_cpu) = match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => (
                timeval_to_duration(usage.user_time()),
                timeval_to_duration(usage.system_time()),
            ),
            Err(_) => (Duration::ZERO, Duration::ZERO),
        };
        Self {
            started: Instant::now(),
            user_cpu,
            system_cpu,
        }
    }

    /// Usage accumulated since [`ProcessClock::start`].
    pub fn sample(&self) -> TimingSample {
        let wall = self.started.elapsed();
        match getrusage(UsageWho::RUSAGE_SELF) {
            Ok(usage) => TimingSample {
                wall,
                user_cpu: timeval_to_duration(usage.user_time()).saturating_sub(self.user_cpu),
                system_cpu: timeval_to_duration(usage.system_time())
                    .saturating_sub(self.system_cpu),
                max_rss_kib: max_rss_kib(&usage),
            },
            Err(_) => TimingSample {
                wall,
                ..TimingSample::default()
            },
        }
    }
}

/// Snapshot of [`JobMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Jobs whose result was read successfully.
    pub jobs_succeeded: u64,
    /// Jobs that failed, including lost workers.
    pub jobs_failed: u64,
    /// Sum of wall time over successful jobs.
    pub total_wall: Duration,
    /// Sum of CPU time over successful jobs.
    pub total_cpu: Duration,
    /// Largest peak RSS reported by any job, in KiB.
    pub peak_rss_kib: u64,
}

impl MetricsSnapshot {
    /// Mean wall time of successful jobs.
    pub fn average_wall(&self) -> Duration {
        if self.jobs_succeeded == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_wall.as_nanos() / u128::from(self.jobs_succeeded);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Process-wide job metrics.
#[derive(Debug, Default)]
pub struct JobMetrics {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    total_wall_us: AtomicU64,
    total_cpu_us: AtomicU64,
    peak_rss_kib: AtomicU64,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a successful job's sample into the totals.
    pub fn merge(&self, sample: &TimingSample) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.total_wall_us
            .fetch_add(sample.wall.as_micros() as u64, Ordering::Relaxed);
        self.total_cpu_us
            .fetch_add(sample.cpu().as_micros() as u64, Ordering::Relaxed);
        self.peak_rss_kib
            .fetch_max(sample.max_rss_kib, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            total_wall: Duration::from_micros(self.total_wall_us.load(Ordering::Relaxed)),
            total_cpu: Duration::from_micros(self.total_cpu_us.load(Ordering::Relaxed)),
            peak_rss_kib: self.peak_rss_kib.load(Ordering::Relaxed),
        }
    }
}

static GLOBAL: OnceLock<JobMetrics> = OnceLock::new();

/// The metrics shared by every handle in this process.
pub fn global() -> &'static JobMetrics {
    GLOBAL.get_or_init(JobMetrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_clock_measures_wall_time() {
        let clock = ProcessClock::start();
        std::thread::sleep(Duration::from_millis(20));
        let sample = clock.sample();
        assert!(sample.wall >= Duration::from_millis(20));
        assert!(sample.max_rss_kib > 0);
    }

    #[test]
    fn test_process_clock_measures_cpu() {
        let clock = ProcessClock::start();
        let mut acc = 0u64;
        let spin = Instant::now();
        while spin.elapsed() < Duration::from_millis(50) {
            acc = acc.wrapping_mul(31).wrapping_add(7);
        }
        std::hint::black_box(acc);
        let sample = clock.sample();
        assert!(sample.cpu() > Duration::ZERO);
    }

    #[test]
    fn test_job_metrics_merge() {
        let metrics = JobMetrics::new();
        metrics.merge(&TimingSample {
            wall: Duration::from_millis(10),
            user_cpu: Duration::from_millis(4),
            system_cpu: Duration::from_millis(1),
            max_rss_kib: 2048,
        });
        metrics.merge(&TimingSample {
            wall: Duration::from_millis(30),
            user_cpu: Duration::from_millis(6),
            system_cpu: Duration::ZERO,
            max_rss_kib: 1024,
        });
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_succeeded, 2);
        assert_eq!(snapshot.jobs_failed, 1);
        assert_eq!(snapshot.total_wall, Duration::from_millis(40));
        assert_eq!(snapshot.total_cpu, Duration::from_millis(11));
        assert_eq!(snapshot.peak_rss_kib, 2048);
        assert_eq!(snapshot.average_wall(), Duration::from_millis(20));
    }

    #[test]
    fn test_average_wall_with_huge_job_count() {
        let snapshot = MetricsSnapshot {
            jobs_succeeded: 1 << 32,
            total_wall: Duration::from_secs(1 << 32),
            ..MetricsSnapshot::default()
        };
        assert_eq!(snapshot.average_wall(), Duration::from_secs(1));

        let snapshot = MetricsSnapshot {
            jobs_succeeded: (1 << 32) + 1,
            total_wall: Duration::from_secs(3),
            ..MetricsSnapshot::default()
        };
        assert!(snapshot.average_wall() < Duration::from_micros(1));
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = JobMetrics::new().snapshot();
        assert_eq!(snapshot, MetricsSnapshot::default());
        assert_eq!(snapshot.average_wall(), Duration::ZERO);
    }
}
