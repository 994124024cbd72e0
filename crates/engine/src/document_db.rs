//! The per-document-type database.
//!
//! A `DocumentDb` owns its write service, feed handler, sub-DBs,
//! maintenance controller, session manager and config store. It drives
//! the lifecycle on the master thread as one explicit sequence
//! (construct, load, replay the transaction log, redo reprocessing,
//! apply the live config, reprocess, go online) instead of a chain of
//! self-posting tasks, and it tears everything down in a fixed order on
//! `close`.
//!
//! The feed handler calls back into the database through small adapter
//! structs holding weak references, so ownership stays a tree: the
//! database uniquely owns the handler and the views; back-references
//! never keep it alive.

use crate::config::{DocumentDbConfig, MaintenanceConfig, ReconfigParams};
use crate::config_store::{ConfigStore, ConfigStoreError};
use crate::ddb_state::{DdbState, State};
use crate::feed_handler::{
    FeedHandler, FeedHandlerOwner, ReplayConfigHandler, SharedTransLog, TransLogWriter,
};
use crate::feed_view::FeedView;
use crate::maintenance::jobs::{
    bucket_move_job, flush_job, heart_beat_job, lid_space_compaction_job,
    prune_removed_documents_job, prune_session_cache_job, BucketStateCalculator,
    DocumentRetriever,
};
use crate::maintenance::{BucketGuard, MaintenanceController};
use crate::operation::FeedOperation;
use crate::resource_filter::AttributeUsageFilter;
use crate::session::SessionManager;
use crate::status::{StatusReport, StatusState};
use crate::sub_db::SubDbCollection;
use crate::write_service::{WriteService, WriteServiceConfig};
use lodestone_core::{BucketId, DocTypeName, SerialNum};
use lodestone_durability::TransLog;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Builds the write-path sinks for a config snapshot.
pub type FeedViewFactory = Box<dyn Fn(&DocumentDbConfig) -> Arc<dyn FeedView> + Send + Sync>;

/// Errors failing database construction.
#[derive(Debug, Error)]
pub enum DocumentDbError {
    /// The config store had no loadable config at or below the pruned
    /// serial.
    #[error("no valid config at or below serial {serial}")]
    NoValidConfig {
        /// The serial probed.
        serial: SerialNum,
    },

    /// The config store failed.
    #[error(transparent)]
    ConfigStore(#[from] ConfigStoreError),
}

/// Everything a database needs at construction.
pub struct DocumentDbParams {
    /// The served document type.
    pub doc_type_name: DocTypeName,
    /// The bootstrap config snapshot.
    pub config: Arc<DocumentDbConfig>,
    /// Config history persistence.
    pub config_store: Box<dyn ConfigStore>,
    /// The durable transaction log.
    pub trans_log: Box<dyn TransLog>,
    /// Executor sizing.
    pub write_service_config: WriteServiceConfig,
    /// Builds feed views from config snapshots.
    pub feed_view_factory: FeedViewFactory,
}

struct ConfigSlots {
    active: Option<Arc<DocumentDbConfig>>,
    active_generation: i64,
    active_serial: SerialNum,
    pending: Arc<DocumentDbConfig>,
}

struct BucketMoveWiring {
    calculator: Arc<dyn BucketStateCalculator>,
    retriever: Arc<dyn DocumentRetriever>,
}

/// See the module docs.
pub struct DocumentDb {
    doc_type_name: DocTypeName,
    state: Arc<DdbState>,
    write_service: Arc<WriteService>,
    trans_log: SharedTransLog,
    config_store: Mutex<Box<dyn ConfigStore>>,
    write_filter: Arc<AttributeUsageFilter>,
    feed_handler: Arc<FeedHandler>,
    sub_dbs: Arc<SubDbCollection>,
    maintenance: Arc<MaintenanceController>,
    session_manager: Arc<SessionManager>,
    feed_view_factory: FeedViewFactory,
    feed_view: RwLock<Option<Arc<dyn FeedView>>>,
    config: Mutex<ConfigSlots>,
    config_cv: Condvar,
    init_config: Mutex<Option<(Arc<DocumentDbConfig>, SerialNum)>>,
    visibility_delay_ms: AtomicU64,
    bucket_move_wiring: Mutex<Option<BucketMoveWiring>>,
    flush_strategy: Mutex<Option<Arc<dyn Fn() -> Option<SerialNum> + Send + Sync>>>,
    now_micros: Arc<dyn Fn() -> u64 + Send + Sync>,
    close_started: AtomicBool,
}

// ----------------------------------------------------------------------
// Back-reference adapters (weak: the database owns the handler, not the
// other way around)
// ----------------------------------------------------------------------

struct OwnerAdapter {
    db: Weak<DocumentDb>,
}

impl FeedHandlerOwner for OwnerAdapter {
    fn on_transaction_log_replay_done(&self) {
        if let Some(db) = self.db.upgrade() {
            db.on_transaction_log_replay_done();
        }
    }

    fn enter_redo_reprocess_state(&self) {
        if let Some(db) = self.db.upgrade() {
            db.enter_redo_reprocess_state();
        }
    }

    fn on_perform_prune(&self, flushed_serial: SerialNum) {
        if let Some(db) = self.db.upgrade() {
            db.on_perform_prune(flushed_serial);
        }
    }

    fn allow_prune(&self) -> bool {
        self.db
            .upgrade()
            .map(|db| db.state.allow_prune())
            .unwrap_or(false)
    }
}

struct ReplayConfigAdapter {
    db: Weak<DocumentDb>,
}

impl ReplayConfigHandler for ReplayConfigAdapter {
    fn replay_config(&self, serial: SerialNum) {
        if let Some(db) = self.db.upgrade() {
            db.replay_config(serial);
        }
    }
}

impl DocumentDb {
    /// Construct the database: build the subsystem tree, save or resume
    /// the initial config, and load the config the replay will start
    /// from. [`DocumentDb::start`] begins the lifecycle.
    pub fn new(params: DocumentDbParams) -> Result<Arc<Self>, DocumentDbError> {
        let DocumentDbParams {
            doc_type_name,
            config,
            config_store,
            trans_log,
            write_service_config,
            feed_view_factory,
        } = params;
        info!(doc_type = %doc_type_name, "creating document database");

        let state = Arc::new(DdbState::new());
        let write_service = Arc::new(WriteService::new(write_service_config));
        let trans_log: SharedTransLog = Arc::new(Mutex::new(trans_log));
        let write_filter = Arc::new(AttributeUsageFilter::new(
            config.maintenance.resource_limits,
        ));
        let feed_handler = FeedHandler::new(
            Arc::clone(&write_service),
            doc_type_name.clone(),
            Arc::clone(&state),
            Arc::clone(&write_filter) as Arc<dyn crate::resource_filter::ResourceWriteFilter>,
            Box::new(TransLogWriter::new(Arc::clone(&trans_log))),
        );
        let maintenance = MaintenanceController::new(Arc::clone(&write_service));

        let db = Arc::new(DocumentDb {
            doc_type_name,
            state,
            write_service,
            trans_log,
            config_store: Mutex::new(config_store),
            write_filter,
            feed_handler,
            sub_dbs: SubDbCollection::new(),
            maintenance,
            session_manager: Arc::new(SessionManager::new(1024)),
            feed_view_factory,
            feed_view: RwLock::new(None),
            config: Mutex::new(ConfigSlots {
                active: None,
                active_generation: 0,
                active_serial: 0,
                pending: Arc::clone(&config),
            }),
            config_cv: Condvar::new(),
            init_config: Mutex::new(None),
            visibility_delay_ms: AtomicU64::new(0),
            bucket_move_wiring: Mutex::new(None),
            flush_strategy: Mutex::new(None),
            now_micros: Arc::new(|| {
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_micros() as u64)
                    .unwrap_or(0)
            }),
            close_started: AtomicBool::new(false),
        });
        db.feed_handler.set_owner(Arc::new(OwnerAdapter {
            db: Arc::downgrade(&db),
        }));
        db.feed_handler
            .set_replay_config_handler(Arc::new(ReplayConfigAdapter {
                db: Arc::downgrade(&db),
            }));

        db.feed_handler
            .init(db.config_store.lock().get_oldest_serial_num());
        db.save_initial_config(&config);
        db.resume_save_config();

        let config_serial = {
            let store = db.config_store.lock();
            store.get_prev_valid_serial(db.feed_handler.get_pruned_serial_num() + 1)
        };
        if config_serial == 0 {
            error!(
                pruned = db.feed_handler.get_pruned_serial_num(),
                "no valid config to start from"
            );
            return Err(DocumentDbError::NoValidConfig {
                serial: db.feed_handler.get_pruned_serial_num() + 1,
            });
        }
        let loaded = db
            .config_store
            .lock()
            .load_config(config_serial)
            .map_err(|e| {
                error!(serial = config_serial, error = %e, "failed to load startup config");
                e
            })?;
        // Only replay-relevant parts matter until the live config is
        // applied after replay.
        let replay_config = DocumentDbConfig::make_replay_config(&loaded);
        db.write_filter
            .set_config(replay_config.maintenance.resource_limits);
        db.visibility_delay_ms.store(
            replay_config.maintenance.visibility_delay_ms,
            Ordering::Release,
        );
        *db.init_config.lock() = Some((replay_config, config_serial));
        Ok(db)
    }

    fn save_initial_config(&self, config: &Arc<DocumentDbConfig>) {
        if self.config_store.lock().get_best_serial_num() != 0 {
            return; // initial config already present
        }
        let conf_serial = self.feed_handler.inc_serial_num();
        // A noop entry pins the serial space; everything before it is
        // wiped so the log starts at the initial config.
        let noop_serial = self
            .feed_handler
            .store_operation_sync(FeedOperation::Noop { serial: 0 });
        self.feed_handler.sync_tls(noop_serial);
        if let Err(e) = self.feed_handler.tls_prune(conf_serial) {
            warn!(error = %e, "failed pruning while saving initial config");
        }
        if let Err(e) = self.config_store.lock().save_config(config, conf_serial) {
            error!(serial = conf_serial, error = %e, "failed to save initial config");
        }
    }

    fn resume_save_config(&self) {
        let best = self.config_store.lock().get_best_serial_num();
        if best == 0 || best != self.feed_handler.get_serial_num() + 1 {
            return;
        }
        // Interrupted while saving a later config: finish the job by
        // writing its log entry.
        let conf_serial = self.feed_handler.inc_serial_num();
        debug_assert_eq!(conf_serial, best);
        self.feed_handler
            .store_operation_sync(FeedOperation::NewConfig {
                serial: conf_serial,
            });
        self.feed_handler.sync_tls(conf_serial);
        info!(serial = conf_serial, "resumed interrupted config save");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Begin the lifecycle; returns immediately. Use
    /// [`DocumentDb::wait_for_online_state`] to block until serving.
    pub fn start(self: &Arc<Self>) {
        info!(doc_type = %self.doc_type_name, "starting document database");
        self.state.enter_load_state();
        let this = Arc::clone(self);
        self.write_service.master().execute(move || this.perform_start());
    }

    fn perform_start(self: &Arc<Self>) {
        let Some((init_config, init_serial)) = self.init_config.lock().take() else {
            error!("document database started twice");
            return;
        };
        let generation = init_config.generation;
        let view = (self.feed_view_factory)(&init_config);
        *self.feed_view.write() = Some(Arc::clone(&view));
        self.feed_handler.set_active_feed_view(view);
        self.set_active_config(Arc::clone(&init_config), init_serial, generation);

        if !self.state.enter_replay_transaction_log_state() {
            return; // closed under us
        }
        let oldest_flushed = self.sub_dbs.oldest_flushed_serial();
        let newest_flushed = self.sub_dbs.newest_flushed_serial();
        if let Err(e) =
            self.feed_handler
                .replay_transaction_log(oldest_flushed, newest_flushed, &self.trans_log)
        {
            // A log that cannot be read back means lost durability.
            error!(error = %e, "transaction log replay failed");
            panic!("transaction log replay failed: {e}");
        }
        // The feed handler continues the lifecycle through the owner
        // callbacks: redo-reprocess, apply live config, reprocess,
        // online.
        info!(doc_type = %self.doc_type_name, "document database started");
    }

    fn on_transaction_log_replay_done(&self) {
        self.sub_dbs.on_replay_done();
    }

    fn enter_redo_reprocess_state(&self) {
        debug_assert!(self.write_service.master().is_current_thread());
        let runner = self.sub_dbs.reprocessing_runner();
        if !runner.empty() {
            if !self.state.enter_redo_reprocess_state() {
                return;
            }
            runner.run();
            self.sub_dbs
                .on_reprocess_done(self.feed_handler.get_serial_num());
            let serial = self
                .feed_handler
                .store_operation_sync(FeedOperation::Noop { serial: 0 });
            self.feed_handler.sync_tls(serial);
            self.sub_dbs.prune_removed_fields(serial);
        }
        self.enter_apply_live_config_state();
    }

    fn enter_apply_live_config_state(&self) {
        debug_assert!(self.write_service.master().is_current_thread());
        {
            let _slots = self.config.lock();
            if !self.state.enter_apply_live_config_state() {
                return;
            }
        }
        let pending = self.config.lock().pending.clone();
        self.perform_reconfig(pending);
    }

    fn perform_reconfig(&self, config: Arc<DocumentDbConfig>) {
        self.apply_config(config, self.feed_handler.get_serial_num());
        if self.state.state() == State::ApplyLiveConfig {
            self.enter_reprocess_state();
        }
    }

    fn enter_reprocess_state(&self) {
        debug_assert!(self.write_service.master().is_current_thread());
        if !self.state.enter_reprocess_state() {
            return;
        }
        let runner = self.sub_dbs.reprocessing_runner();
        if !runner.empty() {
            runner.run();
            let serial = self
                .feed_handler
                .store_operation_sync(FeedOperation::Noop { serial: 0 });
            self.feed_handler.sync_tls(serial);
            self.sub_dbs.prune_removed_fields(serial);
        }
        self.sub_dbs
            .on_reprocess_done(self.feed_handler.get_serial_num());
        self.enter_online_state();
    }

    fn enter_online_state(&self) {
        debug_assert!(self.write_service.master().is_current_thread());
        // Everything replayed must be committed to the memory structures
        // before search sees the database as up.
        if let Some(view) = self.active_feed_view() {
            view.force_commit(self.feed_handler.get_serial_num());
        }
        self.write_service.sync_all();
        self.state.enter_online_state();
        self.feed_handler.consider_delayed_prune();
        self.perform_start_maintenance();
        info!(doc_type = %self.doc_type_name, "document database online");
    }

    // ------------------------------------------------------------------
    // Config application
    // ------------------------------------------------------------------

    fn set_active_config(
        &self,
        config: Arc<DocumentDbConfig>,
        serial: SerialNum,
        generation: i64,
    ) {
        let mut slots = self.config.lock();
        debug_assert!(generation >= config.generation);
        slots.active = Some(config);
        if slots.active_generation < generation {
            slots.active_generation = generation;
        }
        slots.active_serial = serial;
        self.config_cv.notify_all();
    }

    /// The active config snapshot.
    pub fn get_active_config(&self) -> Option<Arc<DocumentDbConfig>> {
        self.config.lock().active.clone()
    }

    /// The active config generation.
    pub fn get_active_generation(&self) -> i64 {
        self.config.lock().active_generation
    }

    /// Apply a config snapshot at `serial`. Master thread only.
    fn apply_config(&self, mut config: Arc<DocumentDbConfig>, mut serial: SerialNum) {
        if self.state.closed() {
            error!("applying config to closed document db");
            return;
        }
        let generation = config.generation;
        let (cmp, equal_replay) = {
            let slots = self.config.lock();
            let active = match slots.active.as_ref() {
                Some(active) => Arc::clone(active),
                None => {
                    error!("applying config before an active config exists");
                    return;
                }
            };
            if self.state.state() >= State::Online {
                config = DocumentDbConfig::make_delayed_attribute_aspect_config(&config, &active);
            }
            if config.delayed_attribute_aspects {
                self.state.set_config_state_need_restart();
                info!(
                    doc_type = %self.doc_type_name,
                    "delaying attribute aspect changes: need restart"
                );
            }
            (
                active.compare(&config),
                DocumentDbConfig::equal_for_replay(&active, &config),
            )
        };
        let params = ReconfigParams::new(cmp);
        let replay_done = self.feed_handler.get_transaction_log_replay_done();
        if !equal_replay && replay_done {
            // The change is replay-relevant: persist it and mark the spot
            // in the log.
            self.feed_handler.sync_tls(self.feed_handler.get_serial_num());
            serial = self.feed_handler.inc_serial_num();
            if let Err(e) = self.config_store.lock().save_config(&config, serial) {
                error!(serial, error = %e, "failed to save config");
            }
            self.feed_handler
                .store_operation_sync(FeedOperation::NewConfig { serial });
            self.feed_handler.sync_tls(serial);
        }
        let elided_config_save = equal_replay && replay_done;
        // Flush attribute and index changes accumulated under the old
        // config; the new config's serial is the commit point.
        if let Some(view) = self.active_feed_view() {
            view.force_commit(if elided_config_save {
                serial
            } else {
                serial.saturating_sub(1)
            });
        }
        self.write_service.sync_all();

        let new_delay = config.maintenance.visibility_delay_ms;
        let old_delay = self.visibility_delay_ms.swap(new_delay, Ordering::AcqRel);
        let visibility_changed = new_delay != old_delay;
        let limits = self.write_service.service_config();
        if new_delay > 0 {
            self.write_service.set_task_limit(limits.semi_unbound_task_limit);
        } else {
            self.write_service.set_task_limit(limits.default_task_limit);
        }

        if params.should_sub_dbs_change() || visibility_changed {
            self.sync_feed_view(&config);
            if serial < self.feed_handler.get_serial_num() {
                // Not the last entry in the log: reprocessing was already
                // done when this config was first applied.
                self.sub_dbs.reprocessing_runner().reset();
            }
            if self.state.state() == State::Online {
                debug_assert!(self.sub_dbs.reprocessing_runner().empty());
            }
        }
        if params.should_index_manager_change() {
            self.sub_dbs.set_index_schema(config.schema.clone(), serial);
        }
        if !config.delayed_attribute_aspects {
            if self.state.delayed_config() {
                info!(
                    doc_type = %self.doc_type_name,
                    "stopped delaying attribute aspect changes"
                );
            }
            self.state.clear_delayed_config();
        }
        self.set_active_config(Arc::clone(&config), serial, generation);
        if params.should_maintenance_controller_change() {
            self.forward_maintenance_config();
        }
        self.write_filter
            .set_config(config.maintenance.resource_limits);
        if self.sub_dbs.reprocessing_runner().empty() {
            self.sub_dbs.prune_removed_fields(serial);
        }
    }

    /// Install a new config snapshot, blocking until it is active or the
    /// database closes (the caller must observe the closed state).
    pub fn reconfigure(self: &Arc<Self>, snapshot: Arc<DocumentDbConfig>) {
        {
            self.config.lock().pending = Arc::clone(&snapshot);
        }
        let this = Arc::clone(self);
        self.write_service
            .master()
            .execute(move || this.new_config_snapshot());
        let mut slots = self.config.lock();
        while slots.active_generation < snapshot.generation && !self.state.closed() {
            self.config_cv.wait(&mut slots);
        }
    }

    fn new_config_snapshot(&self) {
        let pending = {
            let slots = self.config.lock();
            if slots.active.is_none() {
                debug!("ignoring config snapshot: no active config yet");
                return;
            }
            if !self.state.allow_reconfig() {
                warn!(
                    doc_type = %self.doc_type_name,
                    "ignoring config snapshot: reconfig not allowed until replay is done"
                );
                return;
            }
            Arc::clone(&slots.pending)
        };
        self.perform_reconfig(pending);
    }

    /// Re-install the config stored under `serial` (transaction-log
    /// replay path).
    fn replay_config(&self, serial: SerialNum) {
        if self.get_active_config().is_none() {
            warn!(serial, "missing active config when replaying config");
            return;
        }
        let loaded = match self.config_store.lock().load_config(serial) {
            Ok(config) => config,
            Err(e) => {
                warn!(serial, error = %e, "failed to load replayed config");
                return;
            }
        };
        let config = DocumentDbConfig::make_replay_config(&loaded);
        self.apply_config(config, serial);
        info!(serial, "replayed config");
    }

    // ------------------------------------------------------------------
    // Feed view plumbing
    // ------------------------------------------------------------------

    /// The active feed view.
    pub fn active_feed_view(&self) -> Option<Arc<dyn FeedView>> {
        self.feed_view.read().clone()
    }

    fn sync_feed_view(&self, config: &Arc<DocumentDbConfig>) {
        let new_view = (self.feed_view_factory)(config);
        let old_view = {
            let mut slot = self.feed_view.write();
            slot.replace(Arc::clone(&new_view))
        };
        self.feed_handler.set_active_feed_view(new_view);
        self.perform_drop_feed_view(old_view);
    }

    /// Keep the old view alive until every executor task that may still
    /// reference it has drained, then let it go on the master thread.
    fn perform_drop_feed_view(&self, view: Option<Arc<dyn FeedView>>) {
        let Some(view) = view else { return };
        self.write_service.attribute_field_writer().sync();
        self.write_service.summary().sync();
        let ws = Arc::clone(&self.write_service);
        self.write_service.index().execute(move || {
            ws.index_field_inverter().sync();
            ws.index_field_writer().sync();
            // The view rides in this closure until the master runs it.
            ws.master().execute(move || drop(view));
        });
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Wire the bucket-move job's external collaborators. Takes effect at
    /// the next job injection.
    pub fn set_bucket_move_wiring(
        &self,
        calculator: Arc<dyn BucketStateCalculator>,
        retriever: Arc<dyn DocumentRetriever>,
    ) {
        *self.bucket_move_wiring.lock() = Some(BucketMoveWiring {
            calculator,
            retriever,
        });
    }

    /// Wire the flush job's external flush strategy.
    pub fn set_flush_strategy(
        &self,
        strategy: Arc<dyn Fn() -> Option<SerialNum> + Send + Sync>,
    ) {
        *self.flush_strategy.lock() = Some(strategy);
    }

    fn inject_maintenance_jobs(&self, config: &MaintenanceConfig) {
        self.maintenance.kill_jobs();
        let interval = Duration::from_millis(config.job_interval_ms.max(1));
        self.maintenance
            .register_job_in_master_thread(heart_beat_job(
                Arc::clone(&self.feed_handler),
                interval,
            ));
        self.maintenance
            .register_job_in_default_pool(prune_session_cache_job(
                Arc::clone(&self.session_manager),
                Duration::from_millis(config.session_max_age_ms),
                interval,
            ));
        self.maintenance
            .register_job_in_master_thread(prune_removed_documents_job(
                Arc::clone(&self.feed_handler),
                Arc::clone(self.sub_dbs.removed()),
                Duration::from_millis(config.remove_doc_age_ms),
                interval,
                Arc::clone(&self.now_micros),
            ));
        for sub_db in [
            self.sub_dbs.ready(),
            self.sub_dbs.not_ready(),
            self.sub_dbs.removed(),
        ] {
            self.maintenance
                .register_job_in_default_pool(lid_space_compaction_job(
                    Arc::clone(sub_db),
                    config.lid_bloat_limit,
                    interval,
                ));
        }
        if let Some(wiring) = self.bucket_move_wiring.lock().as_ref() {
            self.maintenance
                .register_job_in_master_thread(bucket_move_job(
                    Arc::clone(&self.feed_handler),
                    Arc::clone(self.sub_dbs.ready()),
                    Arc::clone(self.sub_dbs.not_ready()),
                    Arc::clone(&wiring.calculator),
                    Arc::clone(&wiring.retriever),
                    Arc::clone(self.maintenance.frozen_buckets()),
                    interval,
                ));
        }
        if let Some(strategy) = self.flush_strategy.lock().as_ref() {
            self.maintenance.register_job_in_master_thread(flush_job(
                Arc::clone(&self.feed_handler),
                Arc::clone(strategy),
                interval,
            ));
        }
    }

    fn perform_start_maintenance(&self) {
        let maintenance_config = {
            let slots = self.config.lock();
            if self.state.closed() {
                return;
            }
            slots
                .active
                .as_ref()
                .expect("active config set before going online")
                .maintenance
                .clone()
        };
        if self.maintenance.get_stopping() {
            return;
        }
        self.inject_maintenance_jobs(&maintenance_config);
        self.maintenance.start(&maintenance_config);
    }

    fn forward_maintenance_config(&self) {
        let Some(active) = self.get_active_config() else {
            return;
        };
        if !self.state.closed() {
            if self.maintenance.get_started() && !self.maintenance.get_stopping() {
                self.inject_maintenance_jobs(&active.maintenance);
            }
            self.maintenance.new_config(&active.maintenance);
        }
    }

    fn stop_maintenance(&self) {
        self.maintenance.stop();
    }

    /// Freeze `bucket` against maintenance for the guard's lifetime.
    pub fn lock_bucket(&self, bucket: BucketId) -> BucketGuard {
        BucketGuard::new(Arc::clone(self.maintenance.frozen_buckets()), bucket)
    }

    // ------------------------------------------------------------------
    // Externally driven hooks
    // ------------------------------------------------------------------

    /// Data up to `flushed_serial` is durable on disk.
    pub fn flush_done(&self, flushed_serial: SerialNum) {
        self.feed_handler.flush_done(flushed_serial);
    }

    fn on_perform_prune(&self, flushed_serial: SerialNum) {
        if !self.state.allow_prune() {
            debug_assert!(self.state.closed());
            return;
        }
        self.config_store.lock().prune(flushed_serial);
    }

    /// Flush the transaction log through `serial`.
    pub fn sync(&self, serial: SerialNum) {
        self.feed_handler.sync_tls(serial);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The served document type.
    pub fn name(&self) -> &DocTypeName {
        &self.doc_type_name
    }

    /// The feed handler (submission entry point).
    pub fn feed_handler(&self) -> &Arc<FeedHandler> {
        &self.feed_handler
    }

    /// The sub-DB collection.
    pub fn sub_dbs(&self) -> &Arc<SubDbCollection> {
        &self.sub_dbs
    }

    /// The session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// The resource write filter.
    pub fn write_filter(&self) -> &Arc<AttributeUsageFilter> {
        &self.write_filter
    }

    /// The maintenance controller.
    pub fn maintenance_controller(&self) -> &Arc<MaintenanceController> {
        &self.maintenance
    }

    /// The write service.
    pub fn write_service(&self) -> &Arc<WriteService> {
        &self.write_service
    }

    /// Documents in the ready sub-DB.
    pub fn num_docs(&self) -> usize {
        self.sub_dbs.ready().num_docs()
    }

    /// Block until online or closed.
    pub fn wait_for_online_state(&self) {
        self.state.wait_for_online_state();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state.state()
    }

    /// Health snapshot.
    pub fn report_status(&self) -> StatusReport {
        let component = format!("documentdb:{}", self.doc_type_name);
        let internal_state = self.state.state().as_str();
        let config_state = self.state.config_state().as_str();
        let raw_state = self.state.state();
        if raw_state >= State::Shutdown {
            return StatusReport::new(component, StatusState::Down, internal_state, config_state)
                .with_message("document database is shutting down");
        }
        if self.feed_handler.is_doing_replay() {
            let progress = self.feed_handler.get_replay_progress() * 100.0;
            return StatusReport::new(
                component,
                StatusState::Partial,
                internal_state,
                config_state,
            )
            .with_progress(progress)
            .with_message(format!(
                "replaying transaction log on startup ({}% done)",
                progress as u32
            ));
        }
        match raw_state {
            State::Construct | State::Load | State::ReplayTransactionLog => {
                StatusReport::new(component, StatusState::Partial, internal_state, config_state)
                    .with_message("initializing components")
            }
            State::ApplyLiveConfig => {
                StatusReport::new(component, StatusState::Partial, internal_state, config_state)
                    .with_message("applying live config on startup")
            }
            State::RedoReprocess | State::Reprocess => {
                let progress = self.sub_dbs.reprocessing_runner().progress() * 100.0;
                StatusReport::new(
                    component,
                    StatusState::Partial,
                    internal_state,
                    config_state,
                )
                .with_progress(progress)
                .with_message(format!("reprocessing on startup ({}% done)", progress as u32))
            }
            _ if self.state.delayed_config() => {
                StatusReport::new(component, StatusState::Partial, internal_state, config_state)
                    .with_message("delaying attribute aspect changes in config")
            }
            _ => StatusReport::new(component, StatusState::Up, internal_state, config_state),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Tear everything down in order. Idempotent; later calls return
    /// immediately.
    pub fn close(self: &Arc<Self>) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(doc_type = %self.doc_type_name, "closing document database");
        {
            let _slots = self.config.lock();
            self.state.enter_shutdown_state();
            // Unblock reconfigure() callers; they observe the closed
            // state.
            self.config_cv.notify_all();
        }
        // Complete master tasks that did not observe the shutdown.
        self.write_service.master().sync();
        {
            let this = Arc::clone(self);
            self.write_service
                .master()
                .execute(move || this.tear_down_references());
            self.write_service.master().sync();
        }
        // Feed operations serialize on the master; with the feed router
        // detached by the caller, the sync above drained what was in
        // flight.
        self.stop_maintenance();
        self.write_service.sync_all();
        {
            let this = Arc::clone(self);
            self.write_service
                .master()
                .execute(move || this.close_sub_dbs());
            self.write_service.master().sync();
        }
        self.write_service.shutdown();
        self.maintenance.kill();
        self.feed_handler.close();
        *self.feed_view.write() = None;
        self.session_manager.close();
        self.state.enter_dead_state();
        info!(doc_type = %self.doc_type_name, "document database closed");
    }

    fn tear_down_references(&self) {
        // Cross-database references (imported fields) resolve through the
        // feed views; dropping the active view below severs them.
        debug!("tearing down cross-database references");
    }

    fn close_sub_dbs(&self) {
        debug!(total_docs = self.sub_dbs.total_docs(), "closing sub-DBs");
    }
}

impl Drop for DocumentDb {
    fn drop(&mut self) {
        // close() must have run; the executors hold no Arc cycles back to
        // us, so reaching drop without close means the owner forgot it.
        if !self.close_started.load(Ordering::Acquire) {
            warn!(doc_type = %self.doc_type_name, "document database dropped without close()");
            self.write_service.shutdown();
            self.maintenance.kill();
        }
    }
}
