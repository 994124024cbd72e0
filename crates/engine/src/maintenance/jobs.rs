//! The standard maintenance jobs.
//!
//! Factories producing `MaintenanceJob`s wired to the engine's handles.
//! Jobs that feed operations (heartbeat, tombstone pruning, bucket
//! moves) are registered on the master thread; sweeps over internal
//! structures run in the shared pool.

use crate::feed_handler::FeedHandler;
use crate::maintenance::frozen_buckets::FrozenBuckets;
use crate::maintenance::job::{JobOutcome, MaintenanceJob};
use crate::operation::{MoveOperation, PruneRemovedDocumentsOperation};
use crate::session::SessionManager;
use crate::sub_db::SubDb;
use lodestone_core::{BucketId, DbDocumentId, Document, Lid, SerialNum, SubDbId, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Max tombstones pruned per run slice.
const PRUNE_BATCH: usize = 64;
/// Max documents moved per run slice.
const MOVE_BATCH: usize = 16;

/// Decides which sub-DB a bucket's documents belong in.
pub trait BucketStateCalculator: Send + Sync {
    /// True when the bucket should be searchable on this node.
    fn should_be_ready(&self, bucket: &BucketId) -> bool;
}

/// Fetches stored documents for the bucket-move job. The document store
/// itself is an external collaborator.
pub trait DocumentRetriever: Send + Sync {
    /// The stored document at `(sub_db, lid)`, if any.
    fn retrieve(&self, sub_db: SubDbId, lid: Lid) -> Option<Document>;
}

/// Pings the feed view so the commit horizon advances while idle.
/// Master thread.
pub fn heart_beat_job(handler: Arc<FeedHandler>, interval: Duration) -> MaintenanceJob {
    MaintenanceJob::new("heart_beat", Duration::ZERO, interval, move || {
        handler.heart_beat();
        JobOutcome::Done
    })
}

/// Sweeps idle sessions out of the session cache. Shared pool.
pub fn prune_session_cache_job(
    sessions: Arc<SessionManager>,
    max_age: Duration,
    interval: Duration,
) -> MaintenanceJob {
    MaintenanceJob::new("prune_session_cache", Duration::ZERO, interval, move || {
        sessions.prune(max_age);
        JobOutcome::Done
    })
}

/// Prunes old tombstones from the removed sub-DB in batches. Master
/// thread: each batch becomes a durable `PruneRemovedDocuments`
/// operation, after which the tombstone lids are unbound here (the feed
/// view drops any index residue on dispatch).
pub fn prune_removed_documents_job(
    handler: Arc<FeedHandler>,
    removed: Arc<SubDb>,
    max_age: Duration,
    interval: Duration,
    now_micros: Arc<dyn Fn() -> u64 + Send + Sync>,
) -> MaintenanceJob {
    MaintenanceJob::new(
        "prune_removed_documents",
        interval,
        interval,
        move || {
            let cutoff = now_micros().saturating_sub(max_age.as_micros() as u64);
            let doomed: Vec<Lid> = {
                let meta_store = removed.meta_store();
                meta_store
                    .iter()
                    .map(|(_, lid)| *lid)
                    .filter(|&lid| {
                        meta_store
                            .meta(lid)
                            .map(|m| m.timestamp.as_micros() < cutoff)
                            .unwrap_or(false)
                    })
                    .take(PRUNE_BATCH + 1)
                    .collect()
            };
            if doomed.is_empty() {
                return JobOutcome::Done;
            }
            let more = doomed.len() > PRUNE_BATCH;
            let batch: Vec<Lid> = doomed.into_iter().take(PRUNE_BATCH).collect();
            let mut op = PruneRemovedDocumentsOperation::new();
            for &lid in &batch {
                op.add_lid(lid);
            }
            handler.perform_prune_removed_documents(&mut op);
            {
                let mut meta_store = removed.meta_store();
                for lid in batch {
                    meta_store.remove_lid(lid);
                }
            }
            if more {
                JobOutcome::NeedsMoreWork
            } else {
                JobOutcome::Done
            }
        },
    )
}

/// Shrinks a sub-DB's lid space when the unbound fraction exceeds the
/// bloat limit. Shared pool.
pub fn lid_space_compaction_job(
    sub_db: Arc<SubDb>,
    bloat_limit: f64,
    interval: Duration,
) -> MaintenanceJob {
    let name = format!("lid_space_compaction.{}", sub_db.id());
    MaintenanceJob::new(name, interval, interval, move || {
        let mut meta_store = sub_db.meta_store();
        if meta_store.lid_bloat_factor() > bloat_limit {
            let new_limit = meta_store.compact_lid_space();
            debug!(sub_db = %sub_db.id(), new_limit, "compacted lid space");
        }
        JobOutcome::Done
    })
}

/// Moves documents between the ready and not-ready sub-DBs as the bucket
/// distribution says, skipping frozen buckets (a thaw notification
/// reschedules the job). Master thread.
pub fn bucket_move_job(
    handler: Arc<FeedHandler>,
    ready: Arc<SubDb>,
    not_ready: Arc<SubDb>,
    calculator: Arc<dyn BucketStateCalculator>,
    retriever: Arc<dyn DocumentRetriever>,
    frozen: Arc<FrozenBuckets>,
    interval: Duration,
) -> MaintenanceJob {
    MaintenanceJob::new("bucket_move", Duration::ZERO, interval, move || {
        let mut budget = MOVE_BATCH;
        for (from, to, want_ready) in [
            (&not_ready, &ready, true),
            (&ready, &not_ready, false),
        ] {
            let buckets = from.meta_store().buckets();
            for bucket in buckets {
                if calculator.should_be_ready(&bucket) != want_ready {
                    continue;
                }
                if frozen.is_frozen(&bucket) {
                    continue;
                }
                // Collect move candidates without holding the meta-store
                // lock across the dispatch.
                let candidates: Vec<(Lid, Timestamp)> = {
                    let meta_store = from.meta_store();
                    meta_store
                        .lids_in_bucket(&bucket)
                        .into_iter()
                        .take(budget)
                        .filter_map(|lid| meta_store.meta(lid).map(|m| (lid, m.timestamp)))
                        .collect()
                };
                for (lid, timestamp) in candidates {
                    let Some(document) = retriever.retrieve(from.id(), lid) else {
                        continue;
                    };
                    let gid = document.id().global_id();
                    let doc_size = from
                        .meta_store()
                        .meta(lid)
                        .map(|m| m.doc_size)
                        .unwrap_or(0);
                    let op = MoveOperation {
                        serial: 0,
                        document,
                        bucket,
                        timestamp,
                        from: DbDocumentId::new(from.id(), lid),
                        to: DbDocumentId::new(to.id(), 0),
                    };
                    handler.handle_move(op);
                    from.meta_store().remove(&gid);
                    to.meta_store().put(gid, bucket, timestamp, doc_size);
                    budget -= 1;
                    if budget == 0 {
                        return JobOutcome::NeedsMoreWork;
                    }
                }
            }
        }
        JobOutcome::Done
    })
}

/// Periodically flushes through an external flush strategy and reports
/// the flushed serial back to the feed handler (which in turn drives TLS
/// pruning). Master thread.
pub fn flush_job(
    handler: Arc<FeedHandler>,
    flush: Arc<dyn Fn() -> Option<SerialNum> + Send + Sync>,
    interval: Duration,
) -> MaintenanceJob {
    MaintenanceJob::new("flush", interval, interval, move || {
        if let Some(flushed_serial) = flush() {
            debug!(flushed_serial, "flush strategy completed");
            handler.flush_done(flushed_serial);
        }
        JobOutcome::Done
    })
}
