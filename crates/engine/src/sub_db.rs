//! The three sub-databases and the reprocessing runner.
//!
//! Documents are partitioned by lifecycle stage: Ready (indexed and
//! searchable), NotReady (stored only), Removed (tombstones awaiting
//! pruning). Each sub-DB owns a document meta store and tracks the
//! serial its structures are flushed to; the minimum across sub-DBs is
//! the replay floor.
//!
//! The reprocessing runner holds derived-structure rebuild tasks queued
//! by a config change; they run on the master thread between replay and
//! online.

use crate::meta_store::DocumentMetaStore;
use lodestone_core::{Schema, SerialNum, SubDbId};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One lifecycle partition of the document space.
pub struct SubDb {
    id: SubDbId,
    meta_store: Mutex<DocumentMetaStore>,
    flushed_serial: AtomicU64,
}

impl SubDb {
    /// An empty sub-DB.
    pub fn new(id: SubDbId) -> Arc<Self> {
        Arc::new(SubDb {
            id,
            meta_store: Mutex::new(DocumentMetaStore::new()),
            flushed_serial: AtomicU64::new(0),
        })
    }

    /// Which partition this is.
    pub fn id(&self) -> SubDbId {
        self.id
    }

    /// The sub-DB's meta store.
    pub fn meta_store(&self) -> MutexGuard<'_, DocumentMetaStore> {
        self.meta_store.lock()
    }

    /// Serial this sub-DB's structures are flushed to.
    pub fn flushed_serial(&self) -> SerialNum {
        self.flushed_serial.load(Ordering::Acquire)
    }

    /// Record a flush.
    pub fn set_flushed_serial(&self, serial: SerialNum) {
        self.flushed_serial.fetch_max(serial, Ordering::AcqRel);
    }

    /// Number of documents.
    pub fn num_docs(&self) -> usize {
        self.meta_store.lock().num_docs()
    }
}

// ============================================================================
// Reprocessing
// ============================================================================

/// One derived-structure rebuild task.
pub struct ReprocessTask {
    /// What is being rebuilt, for logs.
    pub name: String,
    /// The rebuild itself.
    pub run: Box<dyn FnOnce() + Send>,
}

/// Queue of reprocessing tasks with coarse progress tracking.
#[derive(Default)]
pub struct ReprocessingRunner {
    tasks: Mutex<Vec<ReprocessTask>>,
    progress: Mutex<f32>,
}

impl ReprocessingRunner {
    /// An empty runner.
    pub fn new() -> Self {
        ReprocessingRunner::default()
    }

    /// True when no tasks are queued.
    pub fn empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Queue a task.
    pub fn add_task(&self, task: ReprocessTask) {
        self.tasks.lock().push(task);
    }

    /// Run every queued task in order. Master thread only.
    pub fn run(&self) {
        let tasks: Vec<ReprocessTask> = self.tasks.lock().drain(..).collect();
        let total = tasks.len();
        for (i, task) in tasks.into_iter().enumerate() {
            info!(task = %task.name, "reprocessing");
            (task.run)();
            *self.progress.lock() = (i + 1) as f32 / total as f32;
        }
        *self.progress.lock() = 1.0;
    }

    /// Drop queued tasks without running them.
    pub fn reset(&self) {
        self.tasks.lock().clear();
        *self.progress.lock() = 0.0;
    }

    /// Progress in [0, 1].
    pub fn progress(&self) -> f32 {
        *self.progress.lock()
    }
}

// ============================================================================
// Collection
// ============================================================================

/// The three sub-DBs plus shared reprocessing state.
pub struct SubDbCollection {
    ready: Arc<SubDb>,
    not_ready: Arc<SubDb>,
    removed: Arc<SubDb>,
    reprocessing: ReprocessingRunner,
    index_schema: Mutex<Schema>,
    pruned_fields_serial: AtomicU64,
}

impl SubDbCollection {
    /// Three empty sub-DBs.
    pub fn new() -> Arc<Self> {
        Arc::new(SubDbCollection {
            ready: SubDb::new(SubDbId::Ready),
            not_ready: SubDb::new(SubDbId::NotReady),
            removed: SubDb::new(SubDbId::Removed),
            reprocessing: ReprocessingRunner::new(),
            index_schema: Mutex::new(Schema::new()),
            pruned_fields_serial: AtomicU64::new(0),
        })
    }

    /// The ready (searchable) sub-DB.
    pub fn ready(&self) -> &Arc<SubDb> {
        &self.ready
    }

    /// The not-ready (stored only) sub-DB.
    pub fn not_ready(&self) -> &Arc<SubDb> {
        &self.not_ready
    }

    /// The removed (tombstone) sub-DB.
    pub fn removed(&self) -> &Arc<SubDb> {
        &self.removed
    }

    /// Sub-DB by id.
    pub fn get(&self, id: SubDbId) -> &Arc<SubDb> {
        match id {
            SubDbId::Ready => &self.ready,
            SubDbId::NotReady => &self.not_ready,
            SubDbId::Removed => &self.removed,
        }
    }

    /// The reprocessing runner.
    pub fn reprocessing_runner(&self) -> &ReprocessingRunner {
        &self.reprocessing
    }

    /// The replay floor: the lowest flushed serial across sub-DBs.
    pub fn oldest_flushed_serial(&self) -> SerialNum {
        self.ready
            .flushed_serial()
            .min(self.not_ready.flushed_serial())
            .min(self.removed.flushed_serial())
    }

    /// The highest flushed serial across sub-DBs.
    pub fn newest_flushed_serial(&self) -> SerialNum {
        self.ready
            .flushed_serial()
            .max(self.not_ready.flushed_serial())
            .max(self.removed.flushed_serial())
    }

    /// Install the index schema on the ready sub-DB (config application).
    pub fn set_index_schema(&self, schema: Schema, serial: SerialNum) {
        debug!(serial, fields = schema.len(), "installing index schema");
        *self.index_schema.lock() = schema;
    }

    /// The currently installed index schema.
    pub fn index_schema(&self) -> Schema {
        self.index_schema.lock().clone()
    }

    /// Drop residue of schema fields that no longer exist, recording the
    /// serial the cleanup happened at.
    pub fn prune_removed_fields(&self, serial: SerialNum) {
        self.pruned_fields_serial.fetch_max(serial, Ordering::AcqRel);
        debug!(serial, "pruned removed fields");
    }

    /// Serial of the last removed-fields cleanup.
    pub fn pruned_fields_serial(&self) -> SerialNum {
        self.pruned_fields_serial.load(Ordering::Acquire)
    }

    /// Replay has drained; sub-DB structures are consistent with the log.
    pub fn on_replay_done(&self) {
        debug!("sub-DB replay done");
    }

    /// Reprocessing completed up to `serial`.
    pub fn on_reprocess_done(&self, serial: SerialNum) {
        debug!(serial, "sub-DB reprocessing done");
    }

    /// Total documents across sub-DBs.
    pub fn total_docs(&self) -> usize {
        self.ready.num_docs() + self.not_ready.num_docs() + self.removed.num_docs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_flushed_serial_bounds() {
        let subs = SubDbCollection::new();
        subs.ready().set_flushed_serial(10);
        subs.not_ready().set_flushed_serial(4);
        subs.removed().set_flushed_serial(7);
        assert_eq!(subs.oldest_flushed_serial(), 4);
        assert_eq!(subs.newest_flushed_serial(), 10);
        // A flush can never move a sub-DB backwards.
        subs.ready().set_flushed_serial(5);
        assert_eq!(subs.newest_flushed_serial(), 10);
    }

    #[test]
    fn test_reprocessing_runner_runs_in_order() {
        let runner = ReprocessingRunner::new();
        assert!(runner.empty());
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let c = Arc::clone(&counter);
            runner.add_task(ReprocessTask {
                name: format!("task-{i}"),
                run: Box::new(move || {
                    // Each task sees its predecessors done.
                    assert_eq!(c.load(Ordering::SeqCst), i);
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            });
        }
        assert!(!runner.empty());
        runner.run();
        assert!(runner.empty());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(runner.progress(), 1.0);
    }

    #[test]
    fn test_reprocessing_reset_drops_tasks() {
        let runner = ReprocessingRunner::new();
        runner.add_task(ReprocessTask {
            name: "doomed".into(),
            run: Box::new(|| panic!("must not run")),
        });
        runner.reset();
        assert!(runner.empty());
        runner.run();
    }

    #[test]
    fn test_get_by_id() {
        let subs = SubDbCollection::new();
        assert_eq!(subs.get(SubDbId::Ready).id(), SubDbId::Ready);
        assert_eq!(subs.get(SubDbId::Removed).id(), SubDbId::Removed);
    }
}
