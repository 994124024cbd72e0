//! Document meta store: gid -> lid mapping with per-lid metadata.
//!
//! One meta store per sub-DB. Lids are dense u32 indexes (0 reserved).
//! A freed lid goes through a generation hold before it can be handed
//! out again, so readers that resolved the lid under an older generation
//! never see it re-bound mid-read.
//!
//! The `prepare_*` step of a feed view consults `inspect` to fill
//! previous-version info for the newest-wins check.

use lodestone_core::{BucketId, Generation, GlobalId, Lid, Timestamp, RESERVED_LID};
use std::collections::{BTreeMap, VecDeque};

/// Per-lid metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDocumentMeta {
    /// The document's global id.
    pub gid: GlobalId,
    /// The document's bucket.
    pub bucket: BucketId,
    /// The stored version's timestamp.
    pub timestamp: Timestamp,
    /// Serialized document size, for accounting.
    pub doc_size: u32,
}

/// Result of looking a gid up ahead of a document operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InspectResult {
    /// The document's lid, `RESERVED_LID` when absent.
    pub lid: Lid,
    /// The stored version's timestamp (zero when absent).
    pub prev_timestamp: Timestamp,
}

impl InspectResult {
    /// True when the gid is present.
    pub fn found(&self) -> bool {
        self.lid != RESERVED_LID
    }
}

/// Outcome of a put.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PutOutcome {
    /// The lid now holding the document.
    pub lid: Lid,
    /// True when the lid was newly allocated (vs. an overwrite).
    pub allocated: bool,
}

/// gid -> lid map plus lid-indexed metadata for one sub-DB.
#[derive(Default)]
pub struct DocumentMetaStore {
    gid_map: BTreeMap<GlobalId, Lid>,
    metas: Vec<Option<RawDocumentMeta>>, // indexed by lid; slot 0 unused
    free_lids: Vec<Lid>,
    lid_hold1: Vec<Lid>,
    lid_hold2: VecDeque<(Lid, Generation)>,
}

impl DocumentMetaStore {
    /// An empty store.
    pub fn new() -> Self {
        DocumentMetaStore {
            gid_map: BTreeMap::new(),
            metas: vec![None], // lid 0 reserved
            free_lids: Vec::new(),
            lid_hold1: Vec::new(),
            lid_hold2: VecDeque::new(),
        }
    }

    /// Number of documents.
    pub fn num_docs(&self) -> usize {
        self.gid_map.len()
    }

    /// One past the highest lid ever allocated.
    pub fn lid_limit(&self) -> Lid {
        self.metas.len() as Lid
    }

    /// Lids currently on hold (unallocatable until the generation drains).
    pub fn held_lids(&self) -> usize {
        self.lid_hold1.len() + self.lid_hold2.len()
    }

    /// Look up previous-version info for a gid.
    pub fn inspect(&self, gid: &GlobalId) -> InspectResult {
        match self.gid_map.get(gid) {
            Some(&lid) => InspectResult {
                lid,
                prev_timestamp: self.metas[lid as usize]
                    .map(|m| m.timestamp)
                    .unwrap_or_default(),
            },
            None => InspectResult {
                lid: RESERVED_LID,
                prev_timestamp: Timestamp(0),
            },
        }
    }

    /// The metadata for a lid, if bound.
    pub fn meta(&self, lid: Lid) -> Option<&RawDocumentMeta> {
        self.metas.get(lid as usize).and_then(|m| m.as_ref())
    }

    fn allocate_lid(&mut self) -> Lid {
        if let Some(lid) = self.free_lids.pop() {
            return lid;
        }
        let lid = self.metas.len() as Lid;
        self.metas.push(None);
        lid
    }

    /// Bind (or rebind) a gid. Newer-wins is the caller's concern; the
    /// store just records what it is told.
    pub fn put(
        &mut self,
        gid: GlobalId,
        bucket: BucketId,
        timestamp: Timestamp,
        doc_size: u32,
    ) -> PutOutcome {
        match self.gid_map.get(&gid) {
            Some(&lid) => {
                self.metas[lid as usize] = Some(RawDocumentMeta {
                    gid,
                    bucket,
                    timestamp,
                    doc_size,
                });
                PutOutcome {
                    lid,
                    allocated: false,
                }
            }
            None => {
                let lid = self.allocate_lid();
                self.metas[lid as usize] = Some(RawDocumentMeta {
                    gid,
                    bucket,
                    timestamp,
                    doc_size,
                });
                self.gid_map.insert(gid, lid);
                PutOutcome {
                    lid,
                    allocated: true,
                }
            }
        }
    }

    /// Unbind a gid; its lid goes on the hold list. Returns the freed
    /// lid, or `None` when the gid was absent.
    pub fn remove(&mut self, gid: &GlobalId) -> Option<Lid> {
        let lid = self.gid_map.remove(gid)?;
        self.metas[lid as usize] = None;
        self.lid_hold1.push(lid);
        Some(lid)
    }

    /// Unbind by lid (prune path). No-op for unbound lids.
    pub fn remove_lid(&mut self, lid: Lid) -> bool {
        let Some(meta) = self.metas.get(lid as usize).copied().flatten() else {
            return false;
        };
        self.gid_map.remove(&meta.gid);
        self.metas[lid as usize] = None;
        self.lid_hold1.push(lid);
        true
    }

    /// Iterate (gid, lid) pairs in gid order.
    pub fn iter(&self) -> impl Iterator<Item = (&GlobalId, &Lid)> {
        self.gid_map.iter()
    }

    /// Lids bound to documents in `bucket`.
    pub fn lids_in_bucket(&self, bucket: &BucketId) -> Vec<Lid> {
        self.gid_map
            .values()
            .filter(|&&lid| {
                self.metas[lid as usize]
                    .map(|m| m.bucket == *bucket)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Buckets with at least one document.
    pub fn buckets(&self) -> Vec<BucketId> {
        let mut buckets: Vec<BucketId> = self
            .gid_map
            .values()
            .filter_map(|&lid| self.metas[lid as usize].map(|m| m.bucket))
            .collect();
        buckets.sort_unstable();
        buckets.dedup();
        buckets
    }

    /// Tag stage-1 lid holds with `generation`.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        for lid in self.lid_hold1.drain(..) {
            self.lid_hold2.push_back((lid, generation));
        }
    }

    /// Release held lids whose tag is below the oldest used generation;
    /// they become allocatable again.
    pub fn trim_hold_lists(&mut self, oldest_used: Generation) {
        while let Some(&(lid, generation)) = self.lid_hold2.front() {
            if generation >= oldest_used {
                break;
            }
            self.lid_hold2.pop_front();
            self.free_lids.push(lid);
        }
    }

    /// Shrink the lid space down to the highest bound lid + 1. Returns
    /// the new lid limit. Free and held lids above the boundary are
    /// discarded.
    pub fn compact_lid_space(&mut self) -> Lid {
        let highest = self
            .gid_map
            .values()
            .copied()
            .max()
            .unwrap_or(RESERVED_LID);
        let new_limit = highest + 1;
        self.metas.truncate(new_limit as usize);
        self.free_lids.retain(|&lid| lid < new_limit);
        self.lid_hold2.retain(|&(lid, _)| lid < new_limit);
        self.lid_hold1.retain(|&lid| lid < new_limit);
        new_limit
    }

    /// Fraction of the lid space that is unbound; the lid-space
    /// compaction job triggers on this.
    pub fn lid_bloat_factor(&self) -> f64 {
        let limit = self.lid_limit().saturating_sub(1) as f64; // minus reserved
        if limit <= 0.0 {
            return 0.0;
        }
        1.0 - (self.num_docs() as f64 / limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::DocumentId;

    fn gid(local: &str) -> GlobalId {
        DocumentId::parse(&format!("id:ns:t::{local}"))
            .unwrap()
            .global_id()
    }

    fn bucket(local: &str) -> BucketId {
        BucketId::from_gid(&gid(local))
    }

    #[test]
    fn test_put_allocates_dense_lids() {
        let mut store = DocumentMetaStore::new();
        let a = store.put(gid("a"), bucket("a"), Timestamp(1), 10);
        let b = store.put(gid("b"), bucket("b"), Timestamp(2), 10);
        assert!(a.allocated && b.allocated);
        assert_eq!(a.lid, 1);
        assert_eq!(b.lid, 2);
        assert_eq!(store.num_docs(), 2);
    }

    #[test]
    fn test_put_overwrite_keeps_lid() {
        let mut store = DocumentMetaStore::new();
        let first = store.put(gid("a"), bucket("a"), Timestamp(1), 10);
        let second = store.put(gid("a"), bucket("a"), Timestamp(5), 12);
        assert!(!second.allocated);
        assert_eq!(first.lid, second.lid);
        assert_eq!(store.inspect(&gid("a")).prev_timestamp, Timestamp(5));
    }

    #[test]
    fn test_inspect_absent() {
        let store = DocumentMetaStore::new();
        let result = store.inspect(&gid("nope"));
        assert!(!result.found());
        assert_eq!(result.prev_timestamp, Timestamp(0));
    }

    #[test]
    fn test_lid_reuse_gated_by_generation() {
        let mut store = DocumentMetaStore::new();
        let a = store.put(gid("a"), bucket("a"), Timestamp(1), 10);
        store.remove(&gid("a"));
        // Freed but still held: a new put must not reuse the lid yet.
        let b = store.put(gid("b"), bucket("b"), Timestamp(2), 10);
        assert_ne!(a.lid, b.lid);
        store.transfer_hold_lists(7);
        store.trim_hold_lists(7);
        // Generation 7 still in use.
        let c = store.put(gid("c"), bucket("c"), Timestamp(3), 10);
        assert_ne!(a.lid, c.lid);
        store.trim_hold_lists(8);
        let d = store.put(gid("d"), bucket("d"), Timestamp(4), 10);
        assert_eq!(a.lid, d.lid);
    }

    #[test]
    fn test_remove_lid_for_prune() {
        let mut store = DocumentMetaStore::new();
        let a = store.put(gid("a"), bucket("a"), Timestamp(1), 10);
        assert!(store.remove_lid(a.lid));
        assert!(!store.remove_lid(a.lid));
        assert_eq!(store.num_docs(), 0);
        assert_eq!(store.held_lids(), 1);
    }

    #[test]
    fn test_bucket_queries() {
        let mut store = DocumentMetaStore::new();
        store.put(gid("a"), bucket("a"), Timestamp(1), 10);
        store.put(gid("b"), bucket("b"), Timestamp(2), 10);
        let buckets = store.buckets();
        assert!(!buckets.is_empty());
        let in_first = store.lids_in_bucket(&buckets[0]);
        assert!(!in_first.is_empty());
    }

    #[test]
    fn test_compact_lid_space() {
        let mut store = DocumentMetaStore::new();
        for local in ["a", "b", "c", "d"] {
            store.put(gid(local), bucket(local), Timestamp(1), 10);
        }
        // Remove the two highest lids and drain their holds.
        store.remove(&gid("c"));
        store.remove(&gid("d"));
        store.transfer_hold_lists(1);
        store.trim_hold_lists(2);
        assert_eq!(store.lid_limit(), 5);
        assert!(store.lid_bloat_factor() > 0.0);
        let new_limit = store.compact_lid_space();
        assert_eq!(new_limit, 3);
        assert_eq!(store.lid_limit(), 3);
        assert_eq!(store.num_docs(), 2);
    }
}
