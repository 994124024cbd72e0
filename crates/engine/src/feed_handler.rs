//! The single-writer serialization point for all mutating operations.
//!
//! Every mutation flows through the feed handler on the master thread.
//! An operation is either dropped (outdated: the store already holds a
//! strictly newer version), rejected (resource filter, type
//! incompatibility, never for removes), or assigned a monotone serial
//! number, persisted to the transaction log, and dispatched to the
//! active feed view.
//!
//! The handler also coordinates the transaction log across the
//! lifecycle: it drives replay (dispatching reconstructed operations
//! without log re-writes and without tokens), records the flushed-serial
//! watermark, and prunes the log once the owner and the lifecycle state
//! permit, deferring the prune when they do not yet.

use crate::ddb_state::DdbState;
use crate::feed_view::FeedView;
use crate::operation::{
    FeedOperation, MoveOperation, PruneRemovedDocumentsOperation, PutOperation, RemoveOperation,
    UpdateOperation,
};
use crate::resource_filter::ResourceWriteFilter;
use crate::token::{FeedResult, FeedToken};
use crate::write_service::WriteService;
use lodestone_core::{
    CoreError, DocTypeName, Document, DocumentUpdate, ErrorType, FieldKind, SerialNum, Timestamp,
};
use lodestone_durability::{TlsError, TransLog};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// ============================================================================
// Collaborator seams
// ============================================================================

/// The transaction-log seam the handler writes through.
pub trait TlsWriter: Send {
    /// Append one operation. Failure is fatal for the node; implementations
    /// must not return having lost the write.
    fn store_operation(&mut self, op: &FeedOperation);

    /// Discard entries with serial <= `serial`; false when refused.
    fn erase(&mut self, serial: SerialNum) -> bool;

    /// Make everything up to `sync_to` durable; returns the serial the
    /// log is durable through.
    fn sync(&mut self, sync_to: SerialNum) -> SerialNum;
}

/// Shared handle to the node's transaction log.
pub type SharedTransLog = Arc<Mutex<Box<dyn TransLog>>>;

/// Default [`TlsWriter`] over a real transaction log.
pub struct TransLogWriter {
    log: SharedTransLog,
}

impl TransLogWriter {
    /// Write through `log`.
    pub fn new(log: SharedTransLog) -> Self {
        TransLogWriter { log }
    }
}

impl TlsWriter for TransLogWriter {
    fn store_operation(&mut self, op: &FeedOperation) {
        let entry = op.to_tls_entry();
        if let Err(e) = self.log.lock().store_entry(&entry) {
            // Losing a durable write would break the no-serial-gap
            // guarantee; the node must restart and replay instead.
            error!(serial = entry.serial, error = %e, "transaction log append failed");
            panic!("transaction log append failed: {e}");
        }
    }

    fn erase(&mut self, serial: SerialNum) -> bool {
        self.log.lock().erase(serial)
    }

    fn sync(&mut self, sync_to: SerialNum) -> SerialNum {
        match self.log.lock().sync(sync_to) {
            Ok(serial) => serial,
            Err(e) => {
                error!(sync_to, error = %e, "transaction log sync failed");
                panic!("transaction log sync failed: {e}");
            }
        }
    }
}

/// What the handler needs from its owner (the DocumentDB).
pub trait FeedHandlerOwner: Send + Sync {
    /// Replay has drained the transaction log.
    fn on_transaction_log_replay_done(&self);

    /// Continue the lifecycle after replay.
    fn enter_redo_reprocess_state(&self);

    /// The transaction log was pruned to `flushed_serial`; prune dependent
    /// stores (config history) too.
    fn on_perform_prune(&self, flushed_serial: SerialNum);

    /// Whether pruning is currently permitted.
    fn allow_prune(&self) -> bool;
}

/// Hook invoked when replay encounters a `NewConfig` entry.
pub trait ReplayConfigHandler: Send + Sync {
    /// Re-install the config saved under `serial`.
    fn replay_config(&self, serial: SerialNum);
}

// ============================================================================
// Feed state
// ============================================================================

/// The handler's feeding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Before replay has started.
    Init,
    /// Replaying the transaction log.
    ReplayTransactionLog,
    /// Live feeding.
    Normal,
}

#[derive(Debug, Clone, Copy)]
struct ReplayProgress {
    active: bool,
    from: SerialNum,
    to: SerialNum,
    current: SerialNum,
}

// ============================================================================
// FeedHandler
// ============================================================================

/// See the module docs. One per DocumentDB; owned by it.
pub struct FeedHandler {
    write_service: Arc<WriteService>,
    doc_type_name: DocTypeName,
    state: Arc<DdbState>,
    resource_filter: Arc<dyn ResourceWriteFilter>,
    tls_writer: Mutex<Box<dyn TlsWriter>>,
    owner: RwLock<Option<Arc<dyn FeedHandlerOwner>>>,
    replay_config_handler: RwLock<Option<Arc<dyn ReplayConfigHandler>>>,
    feed_view: RwLock<Option<Arc<dyn FeedView>>>,
    serial: AtomicU64,
    pruned_serial: AtomicU64,
    delayed_prune: AtomicBool,
    feed_state: Mutex<FeedState>,
    replay_done: AtomicBool,
    replay_progress: Mutex<ReplayProgress>,
    closed: AtomicBool,
}

impl FeedHandler {
    /// Construct a handler. The owner and replay-config hook are attached
    /// afterwards (they usually reference the structure that owns the
    /// handler).
    pub fn new(
        write_service: Arc<WriteService>,
        doc_type_name: DocTypeName,
        state: Arc<DdbState>,
        resource_filter: Arc<dyn ResourceWriteFilter>,
        tls_writer: Box<dyn TlsWriter>,
    ) -> Arc<Self> {
        Arc::new(FeedHandler {
            write_service,
            doc_type_name,
            state,
            resource_filter,
            tls_writer: Mutex::new(tls_writer),
            owner: RwLock::new(None),
            replay_config_handler: RwLock::new(None),
            feed_view: RwLock::new(None),
            serial: AtomicU64::new(0),
            pruned_serial: AtomicU64::new(0),
            delayed_prune: AtomicBool::new(false),
            feed_state: Mutex::new(FeedState::Init),
            replay_done: AtomicBool::new(false),
            replay_progress: Mutex::new(ReplayProgress {
                active: false,
                from: 0,
                to: 0,
                current: 0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach the owner (non-owning from the owner's perspective; the
    /// owner outlives the handler).
    pub fn set_owner(&self, owner: Arc<dyn FeedHandlerOwner>) {
        *self.owner.write() = Some(owner);
    }

    /// Attach the replay-config hook.
    pub fn set_replay_config_handler(&self, handler: Arc<dyn ReplayConfigHandler>) {
        *self.replay_config_handler.write() = Some(handler);
    }

    /// Install the active feed view. Old views stay alive through any
    /// outstanding `Arc` clones held by in-flight tasks.
    pub fn set_active_feed_view(&self, view: Arc<dyn FeedView>) {
        *self.feed_view.write() = Some(view);
    }

    /// The active feed view.
    pub fn active_feed_view(&self) -> Option<Arc<dyn FeedView>> {
        self.feed_view.read().clone()
    }

    fn view(&self) -> Arc<dyn FeedView> {
        self.feed_view
            .read()
            .clone()
            .expect("feed handler used before a feed view was set")
    }

    /// Seed the serial number from the oldest stored config serial.
    pub fn init(&self, oldest_config_serial: SerialNum) {
        self.serial.store(oldest_config_serial, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Serial numbers
    // ------------------------------------------------------------------

    /// The newest assigned serial.
    pub fn get_serial_num(&self) -> SerialNum {
        self.serial.load(Ordering::Acquire)
    }

    /// Explicitly place the serial counter.
    pub fn set_serial_num(&self, serial: SerialNum) {
        self.serial.store(serial, Ordering::Release);
    }

    /// Allocate the next serial.
    pub fn inc_serial_num(&self) -> SerialNum {
        self.serial.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The prune watermark (newest serial known durable on disk).
    pub fn get_pruned_serial_num(&self) -> SerialNum {
        self.pruned_serial.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Feed state
    // ------------------------------------------------------------------

    /// Current feeding mode.
    pub fn feed_state(&self) -> FeedState {
        *self.feed_state.lock()
    }

    /// Switch to live feeding.
    pub fn change_to_normal_feed_state(&self) {
        *self.feed_state.lock() = FeedState::Normal;
    }

    /// True once replay has drained the log.
    pub fn get_transaction_log_replay_done(&self) -> bool {
        self.replay_done.load(Ordering::Acquire)
    }

    /// True while replay is running.
    pub fn is_doing_replay(&self) -> bool {
        self.replay_progress.lock().active
    }

    /// Replay progress in [0, 1].
    pub fn get_replay_progress(&self) -> f32 {
        let progress = self.replay_progress.lock();
        if progress.active {
            if progress.to <= progress.from {
                return 1.0;
            }
            (progress.current - progress.from) as f32 / (progress.to - progress.from) as f32
        } else if self.replay_done.load(Ordering::Acquire) {
            1.0
        } else {
            0.0
        }
    }

    // ------------------------------------------------------------------
    // Client operation entry points
    // ------------------------------------------------------------------

    /// Submit an operation from any thread. The token completes when the
    /// operation has been handled (or dropped/rejected).
    pub fn perform_operation(self: &Arc<Self>, token: FeedToken, op: FeedOperation) {
        if self.write_service.master().is_current_thread() {
            self.handle_operation(token, op);
            return;
        }
        let this = Arc::clone(self);
        self.write_service
            .master()
            .execute(move || this.handle_operation(token, op));
    }

    /// Handle an operation; the caller guarantees it is on the master
    /// thread.
    pub fn handle_operation(&self, token: FeedToken, op: FeedOperation) {
        debug_assert!(self.write_service.master().is_current_thread());
        if self.closed.load(Ordering::Acquire) || self.state.closed() {
            token.send(
                FeedResult::error(ErrorType::TransientError, "feed handler is closed"),
                false,
            );
            return;
        }
        match op {
            FeedOperation::Put(put) => self.perform_put(token, put),
            FeedOperation::Update(update) => self.perform_update(token, update),
            FeedOperation::Remove(remove) => self.perform_remove(token, remove),
            FeedOperation::Move(mv) => {
                self.handle_move(mv);
            }
            FeedOperation::PruneRemovedDocuments(mut prune) => {
                self.perform_prune_removed_documents(&mut prune);
            }
            other => {
                self.store_operation_sync(other);
            }
        }
    }

    fn consider_write_rejection(
        &self,
        token: &FeedToken,
        kind: &str,
        doc_id: &str,
        update_shaped: bool,
    ) -> bool {
        if self.resource_filter.accept_write_operation() {
            return false;
        }
        let accept_state = self.resource_filter.accept_state();
        let message = format!(
            "{} operation rejected for document '{}' of type '{}': '{}'",
            kind,
            doc_id,
            self.doc_type_name.name(),
            accept_state.message
        );
        debug!(%message, "rejected by resource filter");
        let result = if update_shaped {
            FeedResult::update_error(ErrorType::ResourceExhausted, message)
        } else {
            FeedResult::error(ErrorType::ResourceExhausted, message)
        };
        token.send(result, false);
        true
    }

    fn perform_put(&self, token: FeedToken, mut op: PutOperation) {
        let view = self.view();
        view.prepare_put(&mut op);
        if self.consider_write_rejection(&token, "Put", &op.document.id().to_string(), false) {
            return;
        }
        if !op.prev.prev_timestamp.is_zero() && op.prev.prev_timestamp > op.timestamp {
            debug!(doc_id = %op.document.id(), "dropping outdated put");
            token.set_result(FeedResult::ok(), false);
            return;
        }
        op.serial = self.inc_serial_num();
        self.tls_writer
            .lock()
            .store_operation(&FeedOperation::Put(op.clone()));
        view.handle_put(Some(&token), &op);
    }

    /// Check every field the update touches against the active document
    /// type. Returns the inner rejection message on incompatibility.
    fn check_update_compatible(
        &self,
        view: &Arc<dyn FeedView>,
        update: &DocumentUpdate,
    ) -> Result<(), String> {
        let repo = view.document_type_repo();
        let Some(doc_type) = repo.document_type(self.doc_type_name.name()) else {
            return Err("Field not found".to_string());
        };
        for field_update in update.field_updates() {
            match doc_type.field(&field_update.field) {
                None => return Err("Field not found".to_string()),
                Some(FieldKind::Tensor(schema_type)) => {
                    if let Some(update_type) = field_update.value.tensor_type() {
                        if update_type != schema_type {
                            return Err(format!(
                                "Wrong tensor type: Field tensor type is '{}' but other tensor type is '{}'",
                                schema_type, update_type
                            ));
                        }
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn perform_update(&self, token: FeedToken, mut op: UpdateOperation) {
        let view = self.view();
        if let Err(inner) = self.check_update_compatible(&view, &op.update) {
            let message = format!(
                "Update operation rejected for document '{}' of type '{}': '{}'",
                op.update.id(),
                self.doc_type_name.name(),
                inner
            );
            debug!(%message, "rejected incompatible update");
            token.send(
                FeedResult::update_error(ErrorType::TransientError, message),
                false,
            );
            return;
        }
        if self.consider_write_rejection(&token, "Update", &op.update.id().to_string(), true) {
            return;
        }
        view.prepare_update(&mut op);
        if !op.prev.prev_timestamp.is_zero() && op.prev.prev_timestamp > op.timestamp {
            debug!(doc_id = %op.update.id(), "dropping outdated update");
            token.set_result(FeedResult::update_ok(op.prev.prev_timestamp), false);
            return;
        }
        if op.prev.prev_db_document_id.valid() && !op.prev.prev_marked_as_removed {
            self.perform_internal_update(token, op, &view);
        } else if op.update.create_if_non_existent() {
            self.create_non_existing_document(token, op, &view);
        } else {
            token.set_result(FeedResult::update_ok(Timestamp(0)), false);
        }
    }

    fn perform_internal_update(
        &self,
        token: FeedToken,
        mut op: UpdateOperation,
        view: &Arc<dyn FeedView>,
    ) {
        token.set_result(FeedResult::update_ok(op.prev.prev_timestamp), true);
        op.serial = self.inc_serial_num();
        self.tls_writer
            .lock()
            .store_operation(&FeedOperation::Update(op.clone()));
        view.handle_update(Some(&token), &op);
    }

    /// Update-to-put fallback: apply the update to an empty document and
    /// feed the result as a put under a fresh serial.
    fn create_non_existing_document(
        &self,
        token: FeedToken,
        op: UpdateOperation,
        view: &Arc<dyn FeedView>,
    ) {
        let mut document = Document::new(op.update.id().clone(), op.update.doc_type());
        op.update.apply_to(&mut document);
        let mut put = PutOperation::new(op.bucket, op.timestamp, document);
        put.prev = op.prev;
        put.serial = self.inc_serial_num();
        token.set_result(FeedResult::update_ok(op.timestamp), true);
        self.tls_writer
            .lock()
            .store_operation(&FeedOperation::Put(put.clone()));
        view.handle_put(Some(&token), &put);
    }

    fn perform_remove(&self, token: FeedToken, mut op: RemoveOperation) {
        let view = self.view();
        view.prepare_remove(&mut op);
        // Removes are never subject to the resource filter.
        if !op.prev.prev_timestamp.is_zero() && op.prev.prev_timestamp > op.timestamp {
            debug!(doc_id = %op.document_id, "dropping outdated remove");
            token.set_result(FeedResult::ok(), false);
            return;
        }
        op.serial = self.inc_serial_num();
        self.tls_writer
            .lock()
            .store_operation(&FeedOperation::Remove(op.clone()));
        view.handle_remove(Some(&token), &op);
    }

    // ------------------------------------------------------------------
    // Master-internal operation entry points
    // ------------------------------------------------------------------

    /// Store and dispatch a move. Master thread only; moves are not
    /// subject to the resource filter.
    pub fn handle_move(&self, mut op: MoveOperation) {
        debug_assert!(self.write_service.master().is_current_thread());
        let view = self.view();
        view.prepare_move(&mut op);
        op.serial = self.inc_serial_num();
        self.tls_writer
            .lock()
            .store_operation(&FeedOperation::Move(op.clone()));
        view.handle_move(&op);
    }

    /// Store and dispatch a tombstone prune. Empty prunes are dropped
    /// without a serial.
    pub fn perform_prune_removed_documents(&self, op: &mut PruneRemovedDocumentsOperation) {
        if op.is_empty() {
            return;
        }
        op.serial = self.inc_serial_num();
        self.tls_writer
            .lock()
            .store_operation(&FeedOperation::PruneRemovedDocuments(op.clone()));
        self.view().handle_prune_removed_documents(op);
    }

    /// Assign a serial (when unassigned), store the operation, and return
    /// the serial. For master-internal entries: Noop, NewConfig,
    /// WipeHistory.
    pub fn store_operation_sync(&self, mut op: FeedOperation) -> SerialNum {
        if op.serial_num() == 0 {
            op.set_serial_num(self.inc_serial_num());
        }
        let serial = op.serial_num();
        self.tls_writer.lock().store_operation(&op);
        serial
    }

    /// Advance the commit horizon while idle. Stores a heartbeat entry in
    /// normal feed state; during initialization and replay it only pings
    /// the view.
    pub fn heart_beat(&self) {
        debug_assert!(self.write_service.master().is_current_thread());
        let serial = if self.feed_state() == FeedState::Normal {
            let serial = self.inc_serial_num();
            self.tls_writer
                .lock()
                .store_operation(&FeedOperation::Heartbeat { serial });
            serial
        } else {
            self.get_serial_num()
        };
        self.view().heart_beat(serial);
    }

    // ------------------------------------------------------------------
    // Pruning and durability coordination
    // ------------------------------------------------------------------

    /// Ask the log to drop entries <= `oldest_to_keep`.
    ///
    /// On refusal the watermark is not advanced and an illegal-state
    /// error carrying the exact token is returned.
    pub fn tls_prune(&self, oldest_to_keep: SerialNum) -> Result<(), CoreError> {
        if !self.tls_writer.lock().erase(oldest_to_keep) {
            return Err(CoreError::IllegalState(format!(
                "Failed to prune TLS to token {}.",
                oldest_to_keep
            )));
        }
        self.pruned_serial
            .fetch_max(oldest_to_keep, Ordering::AcqRel);
        Ok(())
    }

    /// Record that data up to `flushed_serial` is durable on disk; prunes
    /// the log when the owner and feed state permit, defers otherwise.
    /// Runs on the master thread.
    pub fn flush_done(self: &Arc<Self>, flushed_serial: SerialNum) {
        let this = Arc::clone(self);
        self.write_service
            .master()
            .execute(move || this.perform_flush_done(flushed_serial));
    }

    fn perform_flush_done(&self, flushed_serial: SerialNum) {
        // A later flush can never unprune an earlier one.
        if flushed_serial <= self.pruned_serial.load(Ordering::Acquire) {
            return;
        }
        self.pruned_serial
            .store(flushed_serial, Ordering::Release);
        let allow = self
            .owner
            .read()
            .as_ref()
            .map(|owner| owner.allow_prune())
            .unwrap_or(false);
        if allow && self.feed_state() == FeedState::Normal {
            self.perform_prune(flushed_serial);
        } else {
            self.delayed_prune.store(true, Ordering::Release);
        }
    }

    fn perform_prune(&self, flushed_serial: SerialNum) {
        match self.tls_prune(flushed_serial) {
            Ok(()) => {
                if let Some(owner) = self.owner.read().as_ref() {
                    owner.on_perform_prune(flushed_serial);
                }
            }
            Err(e) => {
                // The watermark stays where flush_done put it; the next
                // flush retries the prune.
                error!(error = %e, "transaction log prune failed");
            }
        }
    }

    /// Apply a prune that was deferred while replay was running.
    pub fn consider_delayed_prune(&self) {
        if self.delayed_prune.swap(false, Ordering::AcqRel) {
            let flushed_serial = self.pruned_serial.load(Ordering::Acquire);
            if flushed_serial > 0 {
                self.perform_prune(flushed_serial);
            }
        }
    }

    /// Flush the transaction log through `sync_to`.
    pub fn sync_tls(&self, sync_to: SerialNum) -> SerialNum {
        self.tls_writer.lock().sync(sync_to)
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Drain the transaction log above `oldest_flushed`, reconstructing
    /// and applying each operation without re-writing the log and without
    /// tokens. Runs on the master thread; returns when the log is drained
    /// and the handler is in normal feed state.
    ///
    /// Entries are read out under the log lock first, then dispatched
    /// with the lock released: replayed `NewConfig` entries re-enter the
    /// config path, which may itself append to the log.
    pub fn replay_transaction_log(
        &self,
        oldest_flushed: SerialNum,
        newest_flushed: SerialNum,
        log: &SharedTransLog,
    ) -> Result<(), TlsError> {
        debug_assert!(self.write_service.master().is_current_thread());
        *self.feed_state.lock() = FeedState::ReplayTransactionLog;
        let from = oldest_flushed;
        let (to, entries) = {
            let mut log = log.lock();
            let to = log.last_serial();
            let mut entries = Vec::new();
            if to > from {
                let result = log.visit(from, to, &mut |entry| entries.push(entry.clone()));
                if let Err(e) = result {
                    return Err(e);
                }
            }
            (to, entries)
        };
        {
            let mut progress = self.replay_progress.lock();
            *progress = ReplayProgress {
                active: true,
                from,
                to,
                current: from,
            };
        }
        info!(from, to, entries = entries.len(), "replaying transaction log");
        for entry in &entries {
            match FeedOperation::from_tls_entry(entry) {
                Ok(op) => self.replay_operation(op),
                Err(e) => {
                    // The entry was durable but undecodable; skipping it
                    // keeps serials contiguous for what follows.
                    error!(serial = entry.serial, error = %e, "skipping undecodable log entry");
                }
            }
            self.replay_progress.lock().current = entry.serial;
        }
        let resumed = self.get_serial_num().max(to).max(newest_flushed);
        self.serial.store(resumed, Ordering::Release);
        self.replay_progress.lock().active = false;
        self.replay_done.store(true, Ordering::Release);
        info!(serial = resumed, "transaction log replay done");
        let owner = self.owner.read().clone();
        if let Some(owner) = &owner {
            owner.on_transaction_log_replay_done();
        }
        self.change_to_normal_feed_state();
        if let Some(owner) = &owner {
            owner.enter_redo_reprocess_state();
        }
        Ok(())
    }

    fn replay_operation(&self, op: FeedOperation) {
        let view = self.view();
        match &op {
            FeedOperation::Put(put) => view.handle_put(None, put),
            FeedOperation::Update(update) => view.handle_update(None, update),
            FeedOperation::Remove(remove) => view.handle_remove(None, remove),
            FeedOperation::Move(mv) => view.handle_move(mv),
            FeedOperation::PruneRemovedDocuments(prune) => {
                view.handle_prune_removed_documents(prune)
            }
            FeedOperation::NewConfig { serial } => {
                if let Some(handler) = self.replay_config_handler.read().as_ref() {
                    handler.replay_config(*serial);
                }
            }
            FeedOperation::Heartbeat { serial } => view.heart_beat(*serial),
            FeedOperation::Noop { .. } | FeedOperation::WipeHistory { .. } => {}
        }
        let serial = op.serial_num();
        if serial > self.get_serial_num() {
            self.serial.store(serial, Ordering::Release);
        }
    }

    /// Refuse further client operations; in-flight ones complete.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(doc_type = %self.doc_type_name, "feed handler closed");
        }
    }
}
