//! Test doubles for the engine's collaborator seams.
//!
//! These mirror the contracts of the real collaborators while counting
//! every interaction, so scenario tests can assert exactly which sinks
//! were reached (and which were not) for a given operation.

use crate::feed_handler::{FeedHandlerOwner, ReplayConfigHandler, TlsWriter};
use crate::feed_view::FeedView;
use crate::operation::{
    FeedOperation, MoveOperation, PruneRemovedDocumentsOperation, PutOperation, RemoveOperation,
    UpdateOperation,
};
use crate::token::{FeedResult, FeedToken, FeedTokenTransport};
use lodestone_core::{
    DbDocumentId, DocumentTypeRepo, GlobalId, SerialNum, SubDbId, Timestamp,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Token transport
// ============================================================================

/// Captures the result a token delivers and lets a test wait for it.
#[derive(Default)]
pub struct RecordingTransport {
    state: Mutex<Option<(FeedResult, bool)>>,
    cond: Condvar,
}

impl RecordingTransport {
    /// Create a transport plus its token.
    pub fn make() -> (Arc<RecordingTransport>, FeedToken) {
        let transport = Arc::new(RecordingTransport::default());
        let token = FeedToken::new(Box::new(Arc::clone(&transport)));
        (transport, token)
    }

    /// Wait for the result, panicking after `timeout`.
    pub fn await_result(&self, timeout: Duration) -> (FeedResult, bool) {
        let mut state = self.state.lock();
        while state.is_none() {
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                panic!("no token result within {:?}", timeout);
            }
        }
        state.clone().expect("checked above")
    }

    /// The result, if delivered.
    pub fn result(&self) -> Option<(FeedResult, bool)> {
        self.state.lock().clone()
    }
}

impl FeedTokenTransport for Arc<RecordingTransport> {
    fn send(&self, result: FeedResult, document_was_found: bool) {
        let mut state = self.state.lock();
        *state = Some((result, document_was_found));
        self.cond.notify_all();
    }
}

// ============================================================================
// Feed view
// ============================================================================

/// A previous-version entry the view's prepare step hands out.
#[derive(Debug, Clone, Copy)]
pub struct MetaEntry {
    /// Assigned location.
    pub db_document_id: DbDocumentId,
    /// Previous location.
    pub prev_db_document_id: DbDocumentId,
    /// Previous timestamp.
    pub prev_timestamp: Timestamp,
}

impl MetaEntry {
    /// An entry binding `lid` with a previous version at `prev_timestamp`.
    pub fn new(lid: u32, prev_lid: u32, prev_timestamp: Timestamp) -> Self {
        MetaEntry {
            db_document_id: DbDocumentId::new(SubDbId::Ready, lid),
            prev_db_document_id: DbDocumentId::new(SubDbId::Ready, prev_lid),
            prev_timestamp,
        }
    }
}

/// Two-stage gid map mimicking a meta store: entries become visible to
/// `prepare_*` only once allocated.
#[derive(Default)]
pub struct TestMetaStore {
    pool: Mutex<BTreeMap<GlobalId, MetaEntry>>,
    allocated: Mutex<BTreeMap<GlobalId, MetaEntry>>,
}

impl TestMetaStore {
    /// Stage an entry (not yet visible to prepare).
    pub fn insert(&self, gid: GlobalId, entry: MetaEntry) {
        self.pool.lock().insert(gid, entry);
    }

    /// Make a staged entry visible to prepare.
    pub fn allocate(&self, gid: &GlobalId) {
        if let Some(entry) = self.pool.lock().get(gid).copied() {
            self.allocated.lock().insert(*gid, entry);
        }
    }

    /// Visible entry for a gid.
    pub fn get(&self, gid: &GlobalId) -> Option<MetaEntry> {
        self.allocated.lock().get(gid).copied()
    }

    /// Number of visible entries.
    pub fn allocated_len(&self) -> usize {
        self.allocated.lock().len()
    }
}

/// Feed view double counting every dispatch.
pub struct RecordingFeedView {
    repo: Arc<DocumentTypeRepo>,
    /// Meta store consulted by `prepare_*`.
    pub meta_store: TestMetaStore,
    /// Puts handled.
    pub put_count: AtomicI32,
    /// Serial of the last handled put.
    pub put_serial: AtomicU64,
    /// Updates handled.
    pub update_count: AtomicI32,
    /// Serial of the last handled update.
    pub update_serial: AtomicU64,
    /// Removes handled.
    pub remove_count: AtomicI32,
    /// Moves handled.
    pub move_count: AtomicI32,
    /// Prunes handled.
    pub prune_removed_count: AtomicI32,
    /// Heartbeats received.
    pub heartbeat_count: AtomicI32,
    /// Force commits received.
    pub force_commit_count: AtomicI32,
    /// Serial of the last force commit.
    pub force_commit_serial: AtomicU64,
}

impl RecordingFeedView {
    /// A view over the given repo.
    pub fn new(repo: Arc<DocumentTypeRepo>) -> Arc<Self> {
        Arc::new(RecordingFeedView {
            repo,
            meta_store: TestMetaStore::default(),
            put_count: AtomicI32::new(0),
            put_serial: AtomicU64::new(0),
            update_count: AtomicI32::new(0),
            update_serial: AtomicU64::new(0),
            remove_count: AtomicI32::new(0),
            move_count: AtomicI32::new(0),
            prune_removed_count: AtomicI32::new(0),
            heartbeat_count: AtomicI32::new(0),
            force_commit_count: AtomicI32::new(0),
            force_commit_serial: AtomicU64::new(0),
        })
    }

    /// Assert the update/put counters and serials in one go.
    pub fn check_counts(
        &self,
        exp_update_count: i32,
        exp_update_serial: SerialNum,
        exp_put_count: i32,
        exp_put_serial: SerialNum,
    ) {
        assert_eq!(exp_update_count, self.update_count.load(Ordering::SeqCst));
        assert_eq!(exp_update_serial, self.update_serial.load(Ordering::SeqCst));
        assert_eq!(exp_put_count, self.put_count.load(Ordering::SeqCst));
        assert_eq!(exp_put_serial, self.put_serial.load(Ordering::SeqCst));
    }

    fn fill_prev(&self, gid: &GlobalId, prev: &mut crate::operation::PrevInfo) {
        if let Some(entry) = self.meta_store.get(gid) {
            prev.db_document_id = entry.db_document_id;
            prev.prev_db_document_id = entry.prev_db_document_id;
            prev.prev_timestamp = entry.prev_timestamp;
        }
    }
}

impl FeedView for RecordingFeedView {
    fn document_type_repo(&self) -> Arc<DocumentTypeRepo> {
        Arc::clone(&self.repo)
    }

    fn prepare_put(&self, op: &mut PutOperation) {
        let gid = op.document.id().global_id();
        self.fill_prev(&gid, &mut op.prev);
    }

    fn prepare_update(&self, op: &mut UpdateOperation) {
        let gid = op.update.id().global_id();
        self.fill_prev(&gid, &mut op.prev);
    }

    fn handle_put(&self, _token: Option<&FeedToken>, op: &PutOperation) {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.put_serial.store(op.serial, Ordering::SeqCst);
        self.meta_store.allocate(&op.document.id().global_id());
    }

    fn handle_update(&self, _token: Option<&FeedToken>, op: &UpdateOperation) {
        self.update_count.fetch_add(1, Ordering::SeqCst);
        self.update_serial.store(op.serial, Ordering::SeqCst);
    }

    fn handle_remove(&self, _token: Option<&FeedToken>, _op: &RemoveOperation) {
        self.remove_count.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_move(&self, _op: &MoveOperation) {
        self.move_count.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_prune_removed_documents(&self, _op: &PruneRemovedDocumentsOperation) {
        self.prune_removed_count.fetch_add(1, Ordering::SeqCst);
    }

    fn heart_beat(&self, _serial: SerialNum) {
        self.heartbeat_count.fetch_add(1, Ordering::SeqCst);
    }

    fn force_commit(&self, serial: SerialNum) {
        self.force_commit_count.fetch_add(1, Ordering::SeqCst);
        self.force_commit_serial.store(serial, Ordering::SeqCst);
    }
}

// ============================================================================
// TLS writer
// ============================================================================

/// TLS writer double counting stores and erases; erase can be forced to
/// refuse.
pub struct CountingTlsWriter {
    /// Operations stored.
    pub store_count: Arc<AtomicI32>,
    /// Erase calls made.
    pub erase_count: Arc<AtomicI32>,
    /// What erase returns.
    pub erase_return: Arc<AtomicBool>,
    /// Serial of the last stored operation.
    pub last_stored_serial: Arc<AtomicU64>,
}

impl CountingTlsWriter {
    /// A writer plus handles to its counters.
    pub fn make() -> (Box<CountingTlsWriter>, CountingTlsHandles) {
        let handles = CountingTlsHandles {
            store_count: Arc::new(AtomicI32::new(0)),
            erase_count: Arc::new(AtomicI32::new(0)),
            erase_return: Arc::new(AtomicBool::new(true)),
            last_stored_serial: Arc::new(AtomicU64::new(0)),
        };
        let writer = Box::new(CountingTlsWriter {
            store_count: Arc::clone(&handles.store_count),
            erase_count: Arc::clone(&handles.erase_count),
            erase_return: Arc::clone(&handles.erase_return),
            last_stored_serial: Arc::clone(&handles.last_stored_serial),
        });
        (writer, handles)
    }
}

/// Counter handles for a [`CountingTlsWriter`].
#[derive(Clone)]
pub struct CountingTlsHandles {
    /// Operations stored.
    pub store_count: Arc<AtomicI32>,
    /// Erase calls made.
    pub erase_count: Arc<AtomicI32>,
    /// What erase returns.
    pub erase_return: Arc<AtomicBool>,
    /// Serial of the last stored operation.
    pub last_stored_serial: Arc<AtomicU64>,
}

impl TlsWriter for CountingTlsWriter {
    fn store_operation(&mut self, op: &FeedOperation) {
        self.store_count.fetch_add(1, Ordering::SeqCst);
        self.last_stored_serial
            .store(op.serial_num(), Ordering::SeqCst);
    }

    fn erase(&mut self, _serial: SerialNum) -> bool {
        self.erase_count.fetch_add(1, Ordering::SeqCst);
        self.erase_return.load(Ordering::SeqCst)
    }

    fn sync(&mut self, sync_to: SerialNum) -> SerialNum {
        sync_to
    }
}

// ============================================================================
// Resource filter
// ============================================================================

/// Write filter double with a switchable verdict and message.
pub struct TestResourceFilter {
    accept: AtomicBool,
    message: Mutex<String>,
}

impl TestResourceFilter {
    /// A filter accepting everything.
    pub fn new() -> Arc<Self> {
        Arc::new(TestResourceFilter {
            accept: AtomicBool::new(true),
            message: Mutex::new(String::new()),
        })
    }

    /// Start rejecting with `message`.
    pub fn reject_with(&self, message: impl Into<String>) {
        *self.message.lock() = message.into();
        self.accept.store(false, Ordering::SeqCst);
    }

    /// Accept again.
    pub fn accept(&self) {
        self.accept.store(true, Ordering::SeqCst);
    }
}

impl crate::resource_filter::ResourceWriteFilter for TestResourceFilter {
    fn accept_write_operation(&self) -> bool {
        self.accept.load(Ordering::SeqCst)
    }

    fn accept_state(&self) -> crate::resource_filter::AcceptState {
        crate::resource_filter::AcceptState {
            accepted: self.accept.load(Ordering::SeqCst),
            message: self.message.lock().clone(),
        }
    }
}

// ============================================================================
// Owner and replay-config hooks
// ============================================================================

/// Owner double with a switchable prune permission.
pub struct TestOwner {
    /// Whether pruning is permitted.
    pub allow_prune: AtomicBool,
    /// `on_transaction_log_replay_done` calls seen.
    pub replay_done_count: AtomicI32,
    /// `on_perform_prune` calls seen.
    pub perform_prune_count: AtomicI32,
}

impl TestOwner {
    /// An owner that forbids pruning (flip `allow_prune` to permit).
    pub fn new() -> Arc<Self> {
        Arc::new(TestOwner {
            allow_prune: AtomicBool::new(false),
            replay_done_count: AtomicI32::new(0),
            perform_prune_count: AtomicI32::new(0),
        })
    }
}

impl FeedHandlerOwner for TestOwner {
    fn on_transaction_log_replay_done(&self) {
        self.replay_done_count.fetch_add(1, Ordering::SeqCst);
    }

    fn enter_redo_reprocess_state(&self) {}

    fn on_perform_prune(&self, _flushed_serial: SerialNum) {
        self.perform_prune_count.fetch_add(1, Ordering::SeqCst);
    }

    fn allow_prune(&self) -> bool {
        self.allow_prune.load(Ordering::SeqCst)
    }
}

/// Replay-config hook double counting invocations.
#[derive(Default)]
pub struct TestReplayConfig {
    /// Serials replayed.
    pub serials: Mutex<Vec<SerialNum>>,
}

impl ReplayConfigHandler for TestReplayConfig {
    fn replay_config(&self, serial: SerialNum) {
        self.serials.lock().push(serial);
    }
}
