//! The maintenance controller.
//!
//! Owns the job runners and the periodic timer that ticks them. The
//! jobs-list lock is held only to copy the list out; job execution
//! happens on the write service's executors. `start` is idempotent
//! within a lifecycle (later calls only update the config), `stop`
//! cancels future ticks and stops the runners, `kill` additionally
//! drops them for good.

use crate::config::MaintenanceConfig;
use crate::maintenance::frozen_buckets::FrozenBuckets;
use crate::maintenance::job::{JobTarget, MaintenanceJob, MaintenanceJobRunner};
use crate::write_service::WriteService;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

struct TimerState {
    stop: bool,
}

struct Timer {
    state: Arc<(Mutex<TimerState>, Condvar)>,
    handle: JoinHandle<()>,
}

/// Scheduler of background maintenance for one DocumentDB.
pub struct MaintenanceController {
    write_service: Arc<WriteService>,
    jobs: Mutex<Vec<Arc<MaintenanceJobRunner>>>,
    frozen_buckets: Arc<FrozenBuckets>,
    config: Mutex<MaintenanceConfig>,
    started: AtomicBool,
    stopping: AtomicBool,
    timer: Mutex<Option<Timer>>,
}

impl MaintenanceController {
    /// A stopped controller bound to the write service.
    pub fn new(write_service: Arc<WriteService>) -> Arc<Self> {
        let controller = Arc::new(MaintenanceController {
            write_service,
            jobs: Mutex::new(Vec::new()),
            frozen_buckets: Arc::new(FrozenBuckets::new()),
            config: Mutex::new(MaintenanceConfig::default()),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            timer: Mutex::new(None),
        });
        // A thaw unblocks document-moving jobs without waiting out the
        // periodic tick.
        let weak = Arc::downgrade(&controller);
        controller
            .frozen_buckets
            .add_thaw_listener(move |_bucket| {
                if let Some(controller) = weak.upgrade() {
                    controller.schedule_all();
                }
            });
        controller
    }

    /// The freeze registry.
    pub fn frozen_buckets(&self) -> &Arc<FrozenBuckets> {
        &self.frozen_buckets
    }

    /// Register a job that must run on the master thread.
    pub fn register_job_in_master_thread(&self, job: MaintenanceJob) {
        self.register(job, JobTarget::Master);
    }

    /// Register a job for the shared pool.
    pub fn register_job_in_default_pool(&self, job: MaintenanceJob) {
        self.register(job, JobTarget::DefaultPool);
    }

    fn register(&self, job: MaintenanceJob, target: JobTarget) {
        debug!(job = job.name(), ?target, "registering maintenance job");
        self.jobs
            .lock()
            .push(MaintenanceJobRunner::new(job, target));
    }

    /// Copy of the current job list.
    pub fn job_list(&self) -> Vec<Arc<MaintenanceJobRunner>> {
        self.jobs.lock().clone()
    }

    /// Stop and drop every registered job (re-injection follows a config
    /// change).
    pub fn kill_jobs(&self) {
        let mut jobs = self.jobs.lock();
        for runner in jobs.iter() {
            runner.stop();
        }
        jobs.clear();
    }

    fn schedule_all(&self) {
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        // Copy out under the lock; never execute under it.
        let jobs = self.job_list();
        for runner in jobs {
            let executor = match runner.target() {
                JobTarget::Master => self.write_service.master(),
                JobTarget::DefaultPool => self.write_service.shared(),
            };
            runner.schedule(executor);
        }
    }

    /// Start the periodic timer; on later calls only the config updates.
    pub fn start(self: &Arc<Self>, config: &MaintenanceConfig) {
        *self.config.lock() = config.clone();
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("maintenance already started, config updated");
            return;
        }
        info!(interval_ms = config.job_interval_ms, "starting maintenance");
        let state = Arc::new((Mutex::new(TimerState { stop: false }), Condvar::new()));
        let timer_state = Arc::clone(&state);
        let controller = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("lodestone-maintenance".to_string())
            .spawn(move || {
                let (lock, cond) = &*timer_state;
                loop {
                    let interval =
                        Duration::from_millis(controller.config.lock().job_interval_ms.max(1));
                    {
                        let mut state = lock.lock();
                        if state.stop {
                            return;
                        }
                        cond.wait_for(&mut state, interval);
                        if state.stop {
                            return;
                        }
                    }
                    controller.schedule_all();
                }
            })
            .expect("failed to spawn maintenance timer thread");
        *self.timer.lock() = Some(Timer { state, handle });
    }

    /// Update the config; the next tick picks it up.
    pub fn new_config(&self, config: &MaintenanceConfig) {
        *self.config.lock() = config.clone();
    }

    /// Cancel future ticks and stop the runners. In-flight slices
    /// complete on their executors.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Some(timer) = self.timer.lock().take() {
            {
                let (lock, cond) = &*timer.state;
                lock.lock().stop = true;
                cond.notify_all();
            }
            let _ = timer.handle.join();
        }
        for runner in self.job_list() {
            runner.stop();
        }
    }

    /// Stop irreversibly and drop the jobs.
    pub fn kill(&self) {
        self.stop();
        self.jobs.lock().clear();
    }

    /// True after the first `start`.
    pub fn get_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// True once stopping.
    pub fn get_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::job::JobOutcome;
    use crate::write_service::WriteServiceConfig;
    use std::sync::atomic::AtomicU64;

    fn fast_config() -> MaintenanceConfig {
        MaintenanceConfig {
            job_interval_ms: 10,
            ..MaintenanceConfig::default()
        }
    }

    fn controller() -> Arc<MaintenanceController> {
        MaintenanceController::new(Arc::new(WriteService::new(WriteServiceConfig::default())))
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_periodic_ticks_run_jobs() {
        let controller = controller();
        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        controller.register_job_in_default_pool(MaintenanceJob::new(
            "tick",
            Duration::ZERO,
            Duration::from_millis(10),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                JobOutcome::Done
            },
        ));
        controller.start(&fast_config());
        wait_for(|| counter.load(Ordering::SeqCst) >= 3);
        controller.stop();
        let after_stop = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_start_is_idempotent_and_updates_config() {
        let controller = controller();
        controller.start(&fast_config());
        assert!(controller.get_started());
        let mut slower = fast_config();
        slower.job_interval_ms = 50;
        controller.start(&slower);
        assert_eq!(controller.config.lock().job_interval_ms, 50);
        controller.stop();
    }

    #[test]
    fn test_frozen_bucket_blocks_job_until_thaw() {
        let controller = controller();
        let bucket = lodestone_core::BucketId::new(8, 42);
        let frozen = Arc::clone(controller.frozen_buckets());
        let moved = Arc::new(AtomicU64::new(0));
        let skipped = Arc::new(AtomicU64::new(0));
        let (m, s, f) = (Arc::clone(&moved), Arc::clone(&skipped), Arc::clone(&frozen));
        controller.register_job_in_default_pool(MaintenanceJob::new(
            "move",
            Duration::ZERO,
            Duration::from_millis(10),
            move || {
                if f.is_frozen(&bucket) {
                    s.fetch_add(1, Ordering::SeqCst);
                } else {
                    m.fetch_add(1, Ordering::SeqCst);
                }
                JobOutcome::Done
            },
        ));
        frozen.freeze_bucket(bucket);
        controller.start(&fast_config());
        wait_for(|| skipped.load(Ordering::SeqCst) >= 2);
        assert_eq!(moved.load(Ordering::SeqCst), 0);
        // Thawing notifies the controller, which reschedules the job
        // without waiting for the next tick.
        frozen.thaw_bucket(bucket);
        wait_for(|| moved.load(Ordering::SeqCst) >= 1);
        controller.stop();
    }

    #[test]
    fn test_kill_drops_jobs() {
        let controller = controller();
        controller.register_job_in_master_thread(MaintenanceJob::new(
            "noop",
            Duration::ZERO,
            Duration::from_millis(10),
            || JobOutcome::Done,
        ));
        assert_eq!(controller.job_list().len(), 1);
        controller.kill();
        assert!(controller.job_list().is_empty());
        assert!(controller.get_stopping());
    }
}
