//! Maintenance jobs and their runners.
//!
//! A job is a metadata record plus a run closure returning whether the
//! job finished its current workload. The runner bridges jobs onto an
//! executor: while a run returns `NeedsMoreWork` it reschedules itself
//! immediately (yielding the executor between slices); on `Done` it
//! waits for the controller's next periodic tick.

use crate::write_service::Executor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tracing::{error, trace};

/// What a job run slice reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Workload drained; wait for the next tick.
    Done,
    /// More work pending; reschedule immediately.
    NeedsMoreWork,
}

/// A maintenance job: metadata plus the work itself.
pub struct MaintenanceJob {
    name: String,
    delay: Duration,
    interval: Duration,
    run: Box<dyn FnMut() -> JobOutcome + Send>,
}

impl MaintenanceJob {
    /// Construct a job.
    pub fn new(
        name: impl Into<String>,
        delay: Duration,
        interval: Duration,
        run: impl FnMut() -> JobOutcome + Send + 'static,
    ) -> Self {
        MaintenanceJob {
            name: name.into(),
            delay,
            interval,
            run: Box::new(run),
        }
    }

    /// The job's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Initial delay before the first run.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Tick interval between runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn run_once(&mut self) -> JobOutcome {
        (self.run)()
    }
}

/// Which executor a job runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTarget {
    /// The master thread (jobs touching feed or lifecycle state).
    Master,
    /// The shared bulk pool.
    DefaultPool,
}

/// Schedules one job onto its executor, serializing runs and handling
/// the `NeedsMoreWork` reschedule loop.
pub struct MaintenanceJobRunner {
    job: Mutex<MaintenanceJob>,
    name: String,
    target: JobTarget,
    scheduled: AtomicBool,
    stopped: AtomicBool,
    runs: AtomicU64,
}

impl MaintenanceJobRunner {
    /// Wrap a job for the given executor target.
    pub fn new(job: MaintenanceJob, target: JobTarget) -> Arc<Self> {
        let name = job.name().to_string();
        Arc::new(MaintenanceJobRunner {
            job: Mutex::new(job),
            name,
            target,
            scheduled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        })
    }

    /// The wrapped job's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where the job runs.
    pub fn target(&self) -> JobTarget {
        self.target
    }

    /// Completed run slices.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Acquire)
    }

    /// Stop scheduling; an in-flight slice completes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// True once stopped.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Queue one run slice on `executor` unless already queued, stopped,
    /// or still running. A slice reporting `NeedsMoreWork` reschedules
    /// itself immediately, yielding the executor between slices.
    pub fn schedule(self: &Arc<Self>, executor: &Arc<Executor>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let executor_handle = Arc::clone(executor);
        executor.execute(move || {
            let outcome = {
                let mut job = this.job.lock();
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    job.run_once()
                }));
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // A panicking job is disabled rather than allowed
                        // to take the node down.
                        error!(job = %this.name, "maintenance job panicked, disabling");
                        this.stopped.store(true, Ordering::Release);
                        JobOutcome::Done
                    }
                }
            };
            this.runs.fetch_add(1, Ordering::AcqRel);
            this.scheduled.store(false, Ordering::Release);
            trace!(job = %this.name, ?outcome, "maintenance job slice");
            if outcome == JobOutcome::NeedsMoreWork {
                this.schedule(&executor_handle);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_serializes_and_counts() {
        let executor = Arc::new(Executor::new("job-test", 1, 100));
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let runner = MaintenanceJobRunner::new(
            MaintenanceJob::new(
                "count",
                Duration::ZERO,
                Duration::from_millis(10),
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    JobOutcome::Done
                },
            ),
            JobTarget::DefaultPool,
        );
        runner.schedule(&executor);
        runner.schedule(&executor); // coalesced while queued
        executor.sync();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(runner.run_count(), 1);
        runner.schedule(&executor);
        executor.sync();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        executor.shutdown();
    }

    #[test]
    fn test_needs_more_work_reschedules_until_done() {
        let executor = Arc::new(Executor::new("job-test", 1, 100));
        let remaining = Arc::new(AtomicU64::new(5));
        let r = Arc::clone(&remaining);
        let runner = MaintenanceJobRunner::new(
            MaintenanceJob::new("slices", Duration::ZERO, Duration::from_millis(10), move || {
                if r.fetch_sub(1, Ordering::SeqCst) > 1 {
                    JobOutcome::NeedsMoreWork
                } else {
                    JobOutcome::Done
                }
            }),
            JobTarget::DefaultPool,
        );
        runner.schedule(&executor);
        // The job keeps rescheduling itself; wait until the workload
        // drains.
        for _ in 0..200 {
            if remaining.load(Ordering::SeqCst) == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        executor.sync();
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
        assert_eq!(runner.run_count(), 5);
        executor.shutdown();
    }

    #[test]
    fn test_stopped_runner_does_not_run() {
        let executor = Arc::new(Executor::new("job-test", 1, 100));
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        let runner = MaintenanceJobRunner::new(
            MaintenanceJob::new("count", Duration::ZERO, Duration::from_millis(10), move || {
                c.fetch_add(1, Ordering::SeqCst);
                JobOutcome::Done
            }),
            JobTarget::Master,
        );
        runner.stop();
        runner.schedule(&executor);
        executor.sync();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        executor.shutdown();
    }

    #[test]
    fn test_panicking_job_is_disabled() {
        let executor = Arc::new(Executor::new("job-test", 1, 100));
        let runner = MaintenanceJobRunner::new(
            MaintenanceJob::new("bad", Duration::ZERO, Duration::from_millis(10), || {
                panic!("intentional test panic")
            }),
            JobTarget::DefaultPool,
        );
        runner.schedule(&executor);
        executor.sync();
        assert!(runner.stopped());
        // Further schedules are refused.
        runner.schedule(&executor);
        executor.sync();
        assert_eq!(runner.run_count(), 1);
        executor.shutdown();
    }
}
