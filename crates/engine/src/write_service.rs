//! Named executors for the write path.
//!
//! One DocumentDB owns a `WriteService`: a single-threaded `master`
//! executor where every lifecycle transition and the feed handler's
//! critical section run, five more single-threaded executors so each
//! index structure has exactly one writer, and a shared pool for bulk
//! work whose task limit switches between a default and a semi-unbound
//! value depending on the visibility delay.
//!
//! Executors are strict FIFO per submitting thread, support `sync()`
//! barriers, and bound their queues: `execute` blocks while the queue is
//! at the task limit. Shutdown drops queued-but-unstarted tasks; tasks
//! already running complete.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use tracing::{error, warn};

type Task = Box<dyn FnOnce() + Send>;

struct ExecInner {
    queue: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    idle_cond: Condvar,
    space_cond: Condvar,
    shutdown: AtomicBool,
    active: AtomicUsize,
    task_limit: AtomicUsize,
    worker_ids: Mutex<Vec<ThreadId>>,
}

/// A FIFO executor with one or more worker threads.
pub struct Executor {
    name: &'static str,
    inner: Arc<ExecInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawn an executor named `name` with `num_threads` workers and the
    /// given queue bound.
    pub fn new(name: &'static str, num_threads: usize, task_limit: usize) -> Self {
        assert!(num_threads > 0);
        let inner = Arc::new(ExecInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            idle_cond: Condvar::new(),
            space_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            task_limit: AtomicUsize::new(task_limit),
            worker_ids: Mutex::new(Vec::new()),
        });
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let inner_clone = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("lodestone-{}-{}", name, i))
                .spawn(move || {
                    inner_clone.worker_ids.lock().push(std::thread::current().id());
                    worker_loop(&inner_clone);
                })
                .expect("failed to spawn executor worker thread");
            workers.push(handle);
        }
        Executor {
            name,
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// The executor's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue a task. Blocks while the queue is at the task limit; drops
    /// the task (with a warning) after shutdown.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            warn!(executor = self.name, "task submitted after shutdown, dropped");
            return;
        }
        let mut queue = self.inner.queue.lock();
        // The executor's own worker must not block on queue space: the
        // task it would wait for is behind the one it is running.
        if !self.is_current_thread() {
            while queue.len() >= self.inner.task_limit.load(Ordering::Acquire) {
                if self.inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                self.inner.space_cond.wait(&mut queue);
            }
        }
        queue.push_back(Box::new(task));
        self.inner.work_ready.notify_one();
    }

    /// Wait until every task queued before this call has completed.
    ///
    /// Calling from the executor's own worker thread is a no-op: the
    /// caller *is* the in-flight task.
    pub fn sync(&self) {
        if self.is_current_thread() {
            return;
        }
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active.load(Ordering::Acquire) > 0 {
            self.inner.idle_cond.wait(&mut queue);
        }
    }

    /// Change the queue bound; raising it wakes blocked submitters.
    pub fn set_task_limit(&self, limit: usize) {
        self.inner.task_limit.store(limit, Ordering::Release);
        let _queue = self.inner.queue.lock();
        self.inner.space_cond.notify_all();
    }

    /// Current queue bound.
    pub fn task_limit(&self) -> usize {
        self.inner.task_limit.load(Ordering::Acquire)
    }

    /// True when called from one of this executor's worker threads.
    pub fn is_current_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.inner.worker_ids.lock().iter().any(|id| *id == current)
    }

    /// Stop the executor: queued-but-unstarted tasks are dropped, running
    /// tasks complete, workers are joined. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let mut queue = self.inner.queue.lock();
            let dropped = queue.len();
            queue.clear();
            if dropped > 0 {
                warn!(executor = self.name, dropped, "dropped queued tasks at shutdown");
            }
            self.inner.work_ready.notify_all();
            self.inner.space_cond.notify_all();
            self.inner.idle_cond.notify_all();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: &ExecInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.active.fetch_add(1, Ordering::AcqRel);
                    inner.space_cond.notify_one();
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        // catch_unwind keeps a panicking task from killing the worker and
        // from wedging sync() waiters.
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
            error!(
                "executor task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
        let prev_active = inner.active.fetch_sub(1, Ordering::AcqRel);
        if prev_active == 1 {
            let queue = inner.queue.lock();
            if queue.is_empty() {
                inner.idle_cond.notify_all();
            }
        }
    }
}

// ============================================================================
// WriteService
// ============================================================================

/// Sizing for a [`WriteService`].
#[derive(Debug, Clone)]
pub struct WriteServiceConfig {
    /// Queue bound while the visibility delay is zero.
    pub default_task_limit: usize,
    /// Queue bound while commits are batched (visibility delay > 0).
    pub semi_unbound_task_limit: usize,
    /// Worker threads in the shared pool.
    pub shared_threads: usize,
}

impl Default for WriteServiceConfig {
    fn default() -> Self {
        WriteServiceConfig {
            default_task_limit: 1000,
            semi_unbound_task_limit: 50_000,
            shared_threads: 2,
        }
    }
}

/// The named executor set for one DocumentDB.
pub struct WriteService {
    config: WriteServiceConfig,
    master: Arc<Executor>,
    index: Arc<Executor>,
    index_field_inverter: Arc<Executor>,
    index_field_writer: Arc<Executor>,
    summary: Arc<Executor>,
    attribute_field_writer: Arc<Executor>,
    shared: Arc<Executor>,
}

impl WriteService {
    /// Spawn the full executor set.
    pub fn new(config: WriteServiceConfig) -> Self {
        let limit = config.default_task_limit;
        WriteService {
            master: Arc::new(Executor::new("master", 1, limit)),
            index: Arc::new(Executor::new("index", 1, limit)),
            index_field_inverter: Arc::new(Executor::new("inverter", 1, limit)),
            index_field_writer: Arc::new(Executor::new("indexwriter", 1, limit)),
            summary: Arc::new(Executor::new("summary", 1, limit)),
            attribute_field_writer: Arc::new(Executor::new("attribute", 1, limit)),
            shared: Arc::new(Executor::new("shared", config.shared_threads, limit)),
            config,
        }
    }

    /// The master executor: single-threaded, strict FIFO; all lifecycle
    /// transitions and the feed handler critical section run here.
    pub fn master(&self) -> &Arc<Executor> {
        &self.master
    }

    /// The memory-index executor.
    pub fn index(&self) -> &Arc<Executor> {
        &self.index
    }

    /// The index field inverter executor.
    pub fn index_field_inverter(&self) -> &Arc<Executor> {
        &self.index_field_inverter
    }

    /// The index field writer executor.
    pub fn index_field_writer(&self) -> &Arc<Executor> {
        &self.index_field_writer
    }

    /// The document-store (summary) executor.
    pub fn summary(&self) -> &Arc<Executor> {
        &self.summary
    }

    /// The attribute writer executor.
    pub fn attribute_field_writer(&self) -> &Arc<Executor> {
        &self.attribute_field_writer
    }

    /// The shared bulk pool.
    pub fn shared(&self) -> &Arc<Executor> {
        &self.shared
    }

    /// Flush every executor in pipeline order so any work in flight when
    /// the call was made has completed when it returns.
    pub fn sync_all(&self) {
        self.index_field_inverter.sync();
        self.index_field_writer.sync();
        self.attribute_field_writer.sync();
        self.summary.sync();
        self.index.sync();
        self.master.sync();
    }

    /// Switch the shared pool's task limit between the default and the
    /// semi-unbound bound, per the visibility delay.
    pub fn set_task_limit(&self, shared_limit: usize) {
        self.shared.set_task_limit(shared_limit);
    }

    /// The configured limits.
    pub fn service_config(&self) -> &WriteServiceConfig {
        &self.config
    }

    /// Shut every executor down, master last.
    pub fn shutdown(&self) {
        self.index_field_inverter.shutdown();
        self.index_field_writer.shutdown();
        self.attribute_field_writer.shutdown();
        self.summary.shutdown();
        self.index.shutdown();
        self.shared.shutdown();
        self.master.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_fifo_order_single_thread() {
        let executor = Executor::new("test", 1, 1000);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let o = Arc::clone(&order);
            executor.execute(move || o.lock().push(i));
        }
        executor.sync();
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        executor.shutdown();
    }

    #[test]
    fn test_sync_waits_for_running_task() {
        let executor = Executor::new("test", 1, 1000);
        let barrier = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicBool::new(false));
        let b = Arc::clone(&barrier);
        let d = Arc::clone(&done);
        executor.execute(move || {
            b.wait();
            std::thread::sleep(std::time::Duration::from_millis(20));
            d.store(true, Ordering::SeqCst);
        });
        barrier.wait();
        executor.sync();
        assert!(done.load(Ordering::SeqCst));
        executor.shutdown();
    }

    #[test]
    fn test_sync_from_own_thread_is_noop() {
        let executor = Arc::new(Executor::new("test", 1, 1000));
        let e = Arc::clone(&executor);
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        executor.execute(move || {
            // Would deadlock if sync() waited on the in-flight task.
            e.sync();
            r.store(true, Ordering::SeqCst);
        });
        executor.sync();
        assert!(ran.load(Ordering::SeqCst));
        executor.shutdown();
    }

    #[test]
    fn test_is_current_thread() {
        let executor = Arc::new(Executor::new("test", 1, 1000));
        assert!(!executor.is_current_thread());
        let e = Arc::clone(&executor);
        let observed = Arc::new(AtomicBool::new(false));
        let o = Arc::clone(&observed);
        executor.execute(move || o.store(e.is_current_thread(), Ordering::SeqCst));
        executor.sync();
        assert!(observed.load(Ordering::SeqCst));
        executor.shutdown();
    }

    #[test]
    fn test_task_limit_blocks_then_releases() {
        let executor = Executor::new("test", 1, 2);
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        executor.execute(move || {
            b.wait();
        });
        // Wait for the worker to pick the blocker up.
        while executor.inner.active.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let c = Arc::clone(&counter);
            executor.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Queue is now full; the next submit blocks until the barrier task
        // finishes and the worker drains the queue.
        std::thread::scope(|scope| {
            let c = Arc::clone(&counter);
            let executor_ref = &executor;
            let submitter = scope.spawn(move || {
                executor_ref.execute(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(counter.load(Ordering::SeqCst), 0);
            barrier.wait();
            submitter.join().unwrap();
        });
        executor.sync();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        executor.shutdown();
    }

    #[test]
    fn test_shutdown_drops_queued_tasks() {
        let executor = Executor::new("test", 1, 1000);
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        executor.execute(move || {
            b.wait();
        });
        while executor.inner.active.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            executor.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        barrier.wait();
        executor.shutdown();
        // The running task completed; queued ones may have been dropped.
        assert!(counter.load(Ordering::SeqCst) <= 5);
        // Submissions after shutdown are dropped outright.
        let c = Arc::clone(&counter);
        executor.execute(move || {
            c.fetch_add(100, Ordering::SeqCst);
        });
        assert!(counter.load(Ordering::SeqCst) < 100);
    }

    #[test]
    fn test_panicking_task_does_not_wedge_sync() {
        let executor = Executor::new("test", 1, 1000);
        executor.execute(|| panic!("intentional test panic"));
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        executor.execute(move || r.store(true, Ordering::SeqCst));
        executor.sync();
        assert!(ran.load(Ordering::SeqCst));
        executor.shutdown();
    }

    #[test]
    fn test_write_service_sync_all() {
        let service = WriteService::new(WriteServiceConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        for executor in [
            service.master(),
            service.index(),
            service.index_field_inverter(),
            service.index_field_writer(),
            service.summary(),
            service.attribute_field_writer(),
            service.shared(),
        ] {
            let c = Arc::clone(&counter);
            executor.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        service.sync_all();
        service.shared().sync();
        assert_eq!(counter.load(Ordering::SeqCst), 7);
        service.shutdown();
    }

    #[test]
    fn test_write_service_task_limit_switch() {
        let service = WriteService::new(WriteServiceConfig::default());
        let semi = service.service_config().semi_unbound_task_limit;
        service.set_task_limit(semi);
        assert_eq!(service.shared().task_limit(), semi);
        let default = service.service_config().default_task_limit;
        service.set_task_limit(default);
        assert_eq!(service.shared().task_limit(), default);
        service.shutdown();
    }
}
