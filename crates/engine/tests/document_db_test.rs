//! DocumentDB lifecycle tests: startup through replay to online,
//! config application, restart equivalence, maintenance wiring and the
//! shutdown sequence.

use lodestone_core::{
    BucketId, DocTypeName, Document, DocumentId, DocumentType, DocumentTypeRepo, ErrorType,
    FieldKind, Schema, Timestamp,
};
use lodestone_durability::{FileTransLog, TransLogConfig};
use lodestone_engine::config::{DocumentDbConfig, MaintenanceConfig};
use lodestone_engine::config_store::FileConfigStore;
use lodestone_engine::document_db::{DocumentDb, DocumentDbParams};
use lodestone_engine::feed_view::FeedView;
use lodestone_engine::operation::{FeedOperation, PutOperation, RemoveOperation};
use lodestone_engine::testing::{RecordingFeedView, RecordingTransport};
use lodestone_engine::write_service::WriteServiceConfig;
use lodestone_engine::{State, StatusState};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DOC_TYPE: &str = "searchdocument";

fn schema(with_extra_field: bool) -> Schema {
    let mut schema = Schema::new();
    schema.add_field("i1", FieldKind::IndexString);
    if with_extra_field {
        schema.add_field("i2", FieldKind::IndexString);
    }
    schema
}

fn config(generation: i64, with_extra_field: bool) -> Arc<DocumentDbConfig> {
    let schema = schema(with_extra_field);
    let mut repo = DocumentTypeRepo::new();
    repo.add(DocumentType::new(DOC_TYPE, schema.clone()));
    let mut config = DocumentDbConfig::new(generation, DocTypeName::new(DOC_TYPE), schema, repo);
    // Keep the periodic timer quiet unless a test asks for it.
    config.maintenance.job_interval_ms = 60_000;
    Arc::new(config)
}

struct DbFixture {
    db: Arc<DocumentDb>,
    views: Arc<Mutex<Vec<Arc<RecordingFeedView>>>>,
}

impl DbFixture {
    fn build(dir: &Path, bootstrap: Arc<DocumentDbConfig>) -> Self {
        let views: Arc<Mutex<Vec<Arc<RecordingFeedView>>>> = Arc::new(Mutex::new(Vec::new()));
        let factory_views = Arc::clone(&views);
        let trans_log =
            FileTransLog::open(dir.join("tls"), TransLogConfig::for_testing()).unwrap();
        let config_store = FileConfigStore::open(dir.join("configs")).unwrap();
        let db = DocumentDb::new(DocumentDbParams {
            doc_type_name: DocTypeName::new(DOC_TYPE),
            config: bootstrap,
            config_store: Box::new(config_store),
            trans_log: Box::new(trans_log),
            write_service_config: WriteServiceConfig::default(),
            feed_view_factory: Box::new(move |config: &DocumentDbConfig| -> Arc<dyn FeedView> {
                let view = RecordingFeedView::new(Arc::new(config.repo.clone()));
                factory_views.lock().push(Arc::clone(&view));
                view
            }),
        })
        .unwrap();
        DbFixture { db, views }
    }

    fn start_online(dir: &Path, bootstrap: Arc<DocumentDbConfig>) -> Self {
        let fixture = Self::build(dir, bootstrap);
        fixture.db.start();
        fixture.db.wait_for_online_state();
        fixture
    }

    fn active_view(&self) -> Arc<RecordingFeedView> {
        Arc::clone(self.views.lock().last().expect("a view was built"))
    }

    fn put(&self, local: &str, ts: u64) -> Arc<RecordingTransport> {
        let document = Document::new(
            DocumentId::parse(&format!("id:test:{DOC_TYPE}::{local}")).unwrap(),
            DOC_TYPE,
        );
        let bucket = BucketId::from_gid(&document.id().global_id());
        let op = PutOperation::new(bucket, Timestamp(ts), document);
        let (transport, token) = RecordingTransport::make();
        self.db
            .feed_handler()
            .perform_operation(token, FeedOperation::Put(op));
        self.db.write_service().master().sync();
        transport
    }

    fn remove(&self, local: &str, ts: u64) {
        let document_id = DocumentId::parse(&format!("id:test:{DOC_TYPE}::{local}")).unwrap();
        let bucket = BucketId::from_gid(&document_id.global_id());
        let op = RemoveOperation::new(bucket, Timestamp(ts), document_id);
        let (_transport, token) = RecordingTransport::make();
        self.db
            .feed_handler()
            .perform_operation(token, FeedOperation::Remove(op));
        self.db.write_service().master().sync();
    }
}

fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Startup and shutdown
// ============================================================================

#[test]
fn test_lifecycle_reaches_online() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::build(dir.path(), config(1, false));
    assert_eq!(fixture.db.state(), State::Construct);
    let status = fixture.db.report_status();
    assert_eq!(status.state, StatusState::Partial);

    fixture.db.start();
    fixture.db.wait_for_online_state();
    assert_eq!(fixture.db.state(), State::Online);
    let status = fixture.db.report_status();
    assert_eq!(status.state, StatusState::Up);
    assert_eq!(status.internal_state, "ONLINE");
    assert_eq!(status.internal_config_state, "OK");
    // Going online force-committed everything replayed.
    assert!(fixture.active_view().force_commit_count.load(Ordering::SeqCst) >= 1);

    fixture.db.close();
    assert_eq!(fixture.db.state(), State::Dead);
    let status = fixture.db.report_status();
    assert_eq!(status.state, StatusState::Down);
}

#[test]
fn test_close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    fixture.db.close();
    fixture.db.close();
    assert_eq!(fixture.db.state(), State::Dead);
}

#[test]
fn test_feed_after_online() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    let transport = fixture.put("doc1", 10);
    let (result, _) = transport.await_result(Duration::from_secs(5));
    assert_eq!(result.error_type, ErrorType::None);
    assert_eq!(fixture.active_view().put_count.load(Ordering::SeqCst), 1);
    fixture.db.close();
}

// ============================================================================
// Replay across restart
// ============================================================================

#[test]
fn test_restart_replays_fed_operations() {
    let dir = TempDir::new().unwrap();
    let final_serial;
    {
        let fixture = DbFixture::start_online(dir.path(), config(1, false));
        fixture.put("a", 10);
        fixture.put("b", 11);
        fixture.put("c", 12);
        fixture.remove("b", 13);
        assert_eq!(fixture.active_view().put_count.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.active_view().remove_count.load(Ordering::SeqCst), 1);
        final_serial = fixture.db.feed_handler().get_serial_num();
        fixture.db.close();
    }
    {
        let fixture = DbFixture::start_online(dir.path(), config(1, false));
        let view = fixture.active_view();
        // The same operations were applied again from the log, in order.
        assert_eq!(view.put_count.load(Ordering::SeqCst), 3);
        assert_eq!(view.remove_count.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.db.feed_handler().get_serial_num(), final_serial);
        assert!(fixture.db.feed_handler().get_transaction_log_replay_done());
        fixture.db.close();
    }
}

#[test]
fn test_split_replay_equals_one_pass() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    // Database A: feed everything in one run, then restart once.
    {
        let fixture = DbFixture::start_online(dir_a.path(), config(1, false));
        for (i, local) in ["a", "b", "c", "d"].iter().enumerate() {
            fixture.put(local, 10 + i as u64);
        }
        fixture.db.close();
    }
    // Database B: feed half, restart, feed the rest, restart again.
    {
        let fixture = DbFixture::start_online(dir_b.path(), config(1, false));
        fixture.put("a", 10);
        fixture.put("b", 11);
        fixture.db.close();
    }
    {
        let fixture = DbFixture::start_online(dir_b.path(), config(1, false));
        fixture.put("c", 12);
        fixture.put("d", 13);
        fixture.db.close();
    }
    let fixture_a = DbFixture::start_online(dir_a.path(), config(1, false));
    let fixture_b = DbFixture::start_online(dir_b.path(), config(1, false));
    assert_eq!(
        fixture_a.active_view().put_count.load(Ordering::SeqCst),
        fixture_b.active_view().put_count.load(Ordering::SeqCst)
    );
    assert_eq!(
        fixture_a.db.feed_handler().get_serial_num(),
        fixture_b.db.feed_handler().get_serial_num()
    );
    fixture_a.db.close();
    fixture_b.db.close();
}

// ============================================================================
// Config application
// ============================================================================

#[test]
fn test_identical_config_apply_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    let serial_before = fixture.db.feed_handler().get_serial_num();
    // Same content, newer generation: nothing replay-relevant changed.
    fixture.db.reconfigure(config(3, false));
    assert_eq!(fixture.db.get_active_generation(), 3);
    assert_eq!(fixture.db.feed_handler().get_serial_num(), serial_before);
    fixture.db.close();
}

#[test]
fn test_schema_change_allocates_serial_and_recreates_view() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    let serial_before = fixture.db.feed_handler().get_serial_num();
    let views_before = fixture.views.lock().len();
    fixture.db.reconfigure(config(2, true));
    assert_eq!(fixture.db.get_active_generation(), 2);
    // A replay-relevant change gets its own serial and log entry.
    assert_eq!(fixture.db.feed_handler().get_serial_num(), serial_before + 1);
    assert!(fixture.views.lock().len() > views_before);
    let active = fixture.db.get_active_config().unwrap();
    assert!(active.schema.field("i2").is_some());
    fixture.db.close();
}

#[test]
fn test_config_survives_restart_through_replay() {
    let dir = TempDir::new().unwrap();
    {
        let fixture = DbFixture::start_online(dir.path(), config(1, false));
        fixture.db.reconfigure(config(2, true));
        fixture.db.close();
    }
    {
        let fixture = DbFixture::start_online(dir.path(), config(2, true));
        let active = fixture.db.get_active_config().unwrap();
        assert!(active.schema.field("i2").is_some());
        fixture.db.close();
    }
}

#[test]
fn test_reconfigure_after_close_returns_without_applying() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    fixture.db.close();
    // Must not block: the condition variable observes the closed state.
    fixture.db.reconfigure(config(9, false));
    assert!(fixture.db.get_active_generation() < 9);
}

#[test]
fn test_delayed_attribute_aspect_flags_need_restart() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    // Change an existing field's aspect while online.
    let mut changed_schema = Schema::new();
    changed_schema.add_field("i1", FieldKind::AttributeString);
    let mut repo = DocumentTypeRepo::new();
    repo.add(DocumentType::new(DOC_TYPE, changed_schema.clone()));
    let mut next = DocumentDbConfig::new(
        2,
        DocTypeName::new(DOC_TYPE),
        changed_schema,
        repo,
    );
    next.maintenance.job_interval_ms = 60_000;
    fixture.db.reconfigure(Arc::new(next));
    let status = fixture.db.report_status();
    assert_eq!(status.internal_config_state, "NEED_RESTART");
    assert_eq!(status.state, StatusState::Partial);
    // The masked config keeps the old aspect for the conflicting field.
    let active = fixture.db.get_active_config().unwrap();
    assert_eq!(active.schema.field("i1"), Some(&FieldKind::IndexString));
    fixture.db.close();
}

// ============================================================================
// Flush-driven pruning
// ============================================================================

#[test]
fn test_flush_done_prunes_log_and_config_history() {
    let dir = TempDir::new().unwrap();
    let serial;
    {
        let fixture = DbFixture::start_online(dir.path(), config(1, false));
        fixture.put("a", 10);
        fixture.put("b", 11);
        serial = fixture.db.feed_handler().get_serial_num();
        fixture.db.flush_done(serial);
        fixture.db.write_service().master().sync();
        assert_eq!(fixture.db.feed_handler().get_pruned_serial_num(), serial);
        fixture.db.close();
    }
    {
        // Everything below the flushed serial is gone from the log, so a
        // restart replays nothing but still resumes the serial space.
        let fixture = DbFixture::start_online(dir.path(), config(1, false));
        assert_eq!(fixture.active_view().put_count.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.db.feed_handler().get_serial_num(), serial);
        fixture.db.close();
    }
}

// ============================================================================
// Maintenance
// ============================================================================

#[test]
fn test_heartbeat_job_runs_after_online() {
    let dir = TempDir::new().unwrap();
    let mut bootstrap = (*config(1, false)).clone();
    bootstrap.maintenance = MaintenanceConfig {
        job_interval_ms: 10,
        ..MaintenanceConfig::default()
    };
    let fixture = DbFixture::start_online(dir.path(), Arc::new(bootstrap));
    let view = fixture.active_view();
    wait_until(|| view.heartbeat_count.load(Ordering::SeqCst) >= 2);
    fixture.db.close();
}

#[test]
fn test_session_cache_prune_job() {
    let dir = TempDir::new().unwrap();
    let mut bootstrap = (*config(1, false)).clone();
    bootstrap.maintenance = MaintenanceConfig {
        job_interval_ms: 10,
        session_max_age_ms: 20,
        ..MaintenanceConfig::default()
    };
    let fixture = DbFixture::start_online(dir.path(), Arc::new(bootstrap));
    fixture.db.session_manager().insert("session-1");
    assert_eq!(fixture.db.session_manager().len(), 1);
    wait_until(|| fixture.db.session_manager().is_empty());
    fixture.db.close();
}

#[test]
fn test_prune_removed_documents_job() {
    let dir = TempDir::new().unwrap();
    let mut bootstrap = (*config(1, false)).clone();
    bootstrap.maintenance = MaintenanceConfig {
        job_interval_ms: 10,
        remove_doc_age_ms: 1,
        ..MaintenanceConfig::default()
    };
    let fixture = DbFixture::start_online(dir.path(), Arc::new(bootstrap));
    // Plant two ancient tombstones.
    {
        let removed = fixture.db.sub_dbs().removed();
        let mut meta_store = removed.meta_store();
        for local in ["x", "y"] {
            let gid = DocumentId::parse(&format!("id:test:{DOC_TYPE}::{local}"))
                .unwrap()
                .global_id();
            meta_store.put(gid, BucketId::from_gid(&gid), Timestamp(1), 10);
        }
    }
    let view = fixture.active_view();
    wait_until(|| view.prune_removed_count.load(Ordering::SeqCst) >= 1);
    wait_until(|| fixture.db.sub_dbs().removed().num_docs() == 0);
    fixture.db.close();
}

#[test]
fn test_bucket_guard_freezes_and_thaws() {
    let dir = TempDir::new().unwrap();
    let fixture = DbFixture::start_online(dir.path(), config(1, false));
    let bucket = BucketId::new(8, 42);
    {
        let guard = fixture.db.lock_bucket(bucket);
        assert_eq!(guard.bucket(), &bucket);
        assert!(fixture
            .db
            .maintenance_controller()
            .frozen_buckets()
            .is_frozen(&bucket));
    }
    assert!(!fixture
        .db
        .maintenance_controller()
        .frozen_buckets()
        .is_frozen(&bucket));
    fixture.db.close();
}
