//! Posting-list attribute: enum index -> sorted doc-id postings.
//!
//! Each posting list lives in the arena. Short lists are a single sorted
//! run (`Array`); past a threshold the list becomes a two-level tree: a
//! root run of chunk descriptors, each pointing at a sorted chunk run.
//! Both representations keep doc ids strictly ascending and unique.
//!
//! Mutation is batched: a `PostingChange` per enum value collects
//! additions and removals, and `apply` merges a whole change map in one
//! pass, replacing list memory and routing the old runs through the
//! hold lists.

use crate::datastore::{DataStore, DataStoreConfig, EntryRef, TypeId};
use crate::enum_store::EnumIndex;
use lodestone_core::{Generation, Lid};
use std::collections::BTreeMap;

/// Lists at most this long use the flat array representation.
pub const ARRAY_MAX: usize = 128;
/// Chunk length for the tree representation.
pub const CHUNK_LEN: usize = 256;

/// One posting in a list.
pub trait Posting: Copy + Default {
    /// Construct from a doc id and weight (ignored by unweighted postings).
    fn new(doc_id: Lid, weight: i32) -> Self;
    /// The posting's doc id.
    fn doc_id(&self) -> Lid;
    /// The posting's weight (0 for unweighted postings).
    fn weight(&self) -> i32;
}

/// Posting for boolean (unweighted) attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocIdPosting(pub Lid);

impl Posting for DocIdPosting {
    fn new(doc_id: Lid, _weight: i32) -> Self {
        DocIdPosting(doc_id)
    }
    fn doc_id(&self) -> Lid {
        self.0
    }
    fn weight(&self) -> i32 {
        0
    }
}

/// Posting for weighted-set attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightedPosting {
    /// The posting's doc id.
    pub doc_id: Lid,
    /// The posting's weight.
    pub weight: i32,
}

impl Posting for WeightedPosting {
    fn new(doc_id: Lid, weight: i32) -> Self {
        WeightedPosting { doc_id, weight }
    }
    fn doc_id(&self) -> Lid {
        self.doc_id
    }
    fn weight(&self) -> i32 {
        self.weight
    }
}

// ============================================================================
// PostingChange
// ============================================================================

/// Batched additions and removals for one enum value.
#[derive(Debug, Clone, Default)]
pub struct PostingChange<P> {
    additions: Vec<P>,
    removals: Vec<Lid>,
}

impl<P: Posting> PostingChange<P> {
    /// An empty change set.
    pub fn new() -> Self {
        PostingChange {
            additions: Vec::new(),
            removals: Vec::new(),
        }
    }

    /// Queue an addition.
    pub fn add(&mut self, doc_id: Lid, weight: i32) -> &mut Self {
        self.additions.push(P::new(doc_id, weight));
        self
    }

    /// Queue a removal.
    pub fn remove(&mut self, doc_id: Lid) -> &mut Self {
        self.removals.push(doc_id);
        self
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.additions.clear();
        self.removals.clear();
    }

    /// The queued additions.
    pub fn additions(&self) -> &[P] {
        &self.additions
    }

    /// The queued removals.
    pub fn removals(&self) -> &[Lid] {
        &self.removals
    }

    /// Sort and deduplicate: additions ascending by doc id with last-wins
    /// on weight, removals ascending and unique.
    pub fn remove_dups(&mut self) {
        // Stable sort keeps submission order within a doc id, so keeping
        // the last occurrence implements last-wins.
        self.additions.sort_by_key(|p| p.doc_id());
        let mut deduped: Vec<P> = Vec::with_capacity(self.additions.len());
        for p in self.additions.drain(..) {
            match deduped.last_mut() {
                Some(last) if last.doc_id() == p.doc_id() => *last = p,
                _ => deduped.push(p),
            }
        }
        self.additions = deduped;
        self.removals.sort_unstable();
        self.removals.dedup();
    }
}

// ============================================================================
// Posting list attribute
// ============================================================================

/// Descriptor of one chunk in the tree representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChunkRef {
    first_doc: Lid,
    entry: EntryRef,
    len: u32,
}

#[derive(Debug, Clone, Copy)]
enum Head {
    Array { entry: EntryRef, len: u32 },
    Tree { root: EntryRef, chunks: u32, len: u32 },
}

impl Head {
    fn len(&self) -> usize {
        match self {
            Head::Array { len, .. } => *len as usize,
            Head::Tree { len, .. } => *len as usize,
        }
    }
}

/// Maps enum-value indexes to posting lists stored in the arena.
pub struct PostingListAttribute<P> {
    elems: DataStore<P>,
    chunk_store: DataStore<ChunkRef>,
    elem_type: TypeId,
    chunk_type: TypeId,
    heads: BTreeMap<EnumIndex, Head>,
}

impl<P: Posting> PostingListAttribute<P> {
    /// Create an empty attribute.
    pub fn new() -> Self {
        let mut elems = DataStore::new(DataStoreConfig::default());
        let elem_type = elems.register_type(4096, false);
        let mut chunk_store = DataStore::new(DataStoreConfig::default());
        let chunk_type = chunk_store.register_type(1024, false);
        PostingListAttribute {
            elems,
            chunk_store,
            elem_type,
            chunk_type,
            heads: BTreeMap::new(),
        }
    }

    /// Number of non-empty posting lists.
    pub fn num_lists(&self) -> usize {
        self.heads.len()
    }

    /// Length of the posting list for `idx` (0 when absent).
    pub fn list_len(&self, idx: EnumIndex) -> usize {
        self.heads.get(&idx).map(Head::len).unwrap_or(0)
    }

    /// True when the list for `idx` uses the tree representation.
    pub fn is_tree(&self, idx: EnumIndex) -> bool {
        matches!(self.heads.get(&idx), Some(Head::Tree { .. }))
    }

    /// Copy out the posting list for `idx`, ascending by doc id.
    pub fn postings(&self, idx: EnumIndex) -> Vec<P> {
        match self.heads.get(&idx) {
            None => Vec::new(),
            Some(Head::Array { entry, len }) => self.elems.slice(*entry, *len as usize).to_vec(),
            Some(Head::Tree { root, chunks, len }) => {
                let mut out = Vec::with_capacity(*len as usize);
                for chunk in self.chunk_store.slice(*root, *chunks as usize) {
                    out.extend_from_slice(self.elems.slice(chunk.entry, chunk.len as usize));
                }
                out
            }
        }
    }

    /// Doc ids of the posting list for `idx`, ascending.
    pub fn doc_ids(&self, idx: EnumIndex) -> Vec<Lid> {
        self.postings(idx).iter().map(Posting::doc_id).collect()
    }

    /// Apply a batched change map: per enum value, removals first, then
    /// additions, preserving strictly ascending unique doc ids.
    pub fn apply(&mut self, mut changes: BTreeMap<EnumIndex, PostingChange<P>>) {
        for (idx, change) in changes.iter_mut() {
            change.remove_dups();
            let merged = self.merge(*idx, change);
            self.replace_list(*idx, merged);
        }
    }

    fn merge(&self, idx: EnumIndex, change: &PostingChange<P>) -> Vec<P> {
        let current = self.postings(idx);
        let removals = change.removals();
        let mut merged: Vec<P> = current
            .into_iter()
            .filter(|p| removals.binary_search(&p.doc_id()).is_err())
            .collect();
        for add in change.additions() {
            match merged.binary_search_by_key(&add.doc_id(), |p| p.doc_id()) {
                Ok(pos) => merged[pos] = *add,
                Err(pos) => merged.insert(pos, *add),
            }
        }
        debug_assert!(
            merged.windows(2).all(|w| w[0].doc_id() < w[1].doc_id()),
            "posting list must be strictly ascending"
        );
        merged
    }

    fn replace_list(&mut self, idx: EnumIndex, merged: Vec<P>) {
        if let Some(old) = self.heads.remove(&idx) {
            self.free_head(old);
        }
        if merged.is_empty() {
            return;
        }
        let head = if merged.len() <= ARRAY_MAX {
            let entry = self.elems.allocate(self.elem_type, merged.len());
            self.elems
                .slice_mut(entry, merged.len())
                .copy_from_slice(&merged);
            Head::Array {
                entry,
                len: merged.len() as u32,
            }
        } else {
            let mut chunk_refs = Vec::new();
            for chunk in merged.chunks(CHUNK_LEN) {
                let entry = self.elems.allocate(self.elem_type, chunk.len());
                self.elems.slice_mut(entry, chunk.len()).copy_from_slice(chunk);
                chunk_refs.push(ChunkRef {
                    first_doc: chunk[0].doc_id(),
                    entry,
                    len: chunk.len() as u32,
                });
            }
            let root = self.chunk_store.allocate(self.chunk_type, chunk_refs.len());
            self.chunk_store
                .slice_mut(root, chunk_refs.len())
                .copy_from_slice(&chunk_refs);
            Head::Tree {
                root,
                chunks: chunk_refs.len() as u32,
                len: merged.len() as u32,
            }
        };
        self.heads.insert(idx, head);
    }

    fn free_head(&mut self, head: Head) {
        match head {
            Head::Array { entry, len } => self.elems.free(entry, len as usize),
            Head::Tree { root, chunks, .. } => {
                for chunk in self.chunk_store.slice(root, chunks as usize).to_vec() {
                    self.elems.free(chunk.entry, chunk.len as usize);
                }
                self.chunk_store.free(root, chunks as usize);
            }
        }
    }

    /// Drop the posting list for `idx` entirely (e.g. when the enum value
    /// is released).
    pub fn clear_postings(&mut self, idx: EnumIndex) {
        if let Some(head) = self.heads.remove(&idx) {
            self.free_head(head);
        }
    }

    /// Move freed runs to the generation-tagged hold stage.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        self.elems.transfer_hold_lists(generation);
        self.chunk_store.transfer_hold_lists(generation);
    }

    /// Reclaim runs whose tag is below the oldest used generation.
    pub fn trim_hold_lists(&mut self, oldest_used: Generation) {
        self.elems.trim_hold_lists(oldest_used);
        self.chunk_store.trim_hold_lists(oldest_used);
    }
}

impl<P: Posting> Default for PostingListAttribute<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change<P: Posting>(adds: &[(Lid, i32)], removes: &[Lid]) -> PostingChange<P> {
        let mut c = PostingChange::new();
        for (doc, weight) in adds {
            c.add(*doc, *weight);
        }
        for doc in removes {
            c.remove(*doc);
        }
        c
    }

    fn apply_one<P: Posting>(
        attr: &mut PostingListAttribute<P>,
        idx: EnumIndex,
        c: PostingChange<P>,
    ) {
        let mut map = BTreeMap::new();
        map.insert(idx, c);
        attr.apply(map);
    }

    #[test]
    fn test_remove_dups_last_wins_on_weight() {
        let mut c: PostingChange<WeightedPosting> =
            change(&[(3, 10), (1, 5), (3, 20), (2, 1)], &[4, 4, 2]);
        c.remove_dups();
        assert_eq!(
            c.additions(),
            &[
                WeightedPosting { doc_id: 1, weight: 5 },
                WeightedPosting { doc_id: 2, weight: 1 },
                WeightedPosting { doc_id: 3, weight: 20 },
            ]
        );
        assert_eq!(c.removals(), &[2, 4]);
    }

    #[test]
    fn test_apply_builds_sorted_list() {
        let mut attr: PostingListAttribute<DocIdPosting> = PostingListAttribute::new();
        let idx = EnumIndex(1);
        apply_one(&mut attr, idx, change(&[(5, 0), (1, 0), (3, 0)], &[]));
        assert_eq!(attr.doc_ids(idx), vec![1, 3, 5]);
        assert_eq!(attr.list_len(idx), 3);
        assert!(!attr.is_tree(idx));
    }

    #[test]
    fn test_apply_removals_before_additions() {
        let mut attr: PostingListAttribute<WeightedPosting> = PostingListAttribute::new();
        let idx = EnumIndex(0);
        apply_one(&mut attr, idx, change(&[(1, 10), (2, 20), (3, 30)], &[]));
        // Remove doc 2 and re-add it with a new weight in the same batch.
        apply_one(&mut attr, idx, change(&[(2, 99)], &[2, 3]));
        let postings = attr.postings(idx);
        assert_eq!(
            postings,
            vec![
                WeightedPosting { doc_id: 1, weight: 10 },
                WeightedPosting { doc_id: 2, weight: 99 },
            ]
        );
    }

    #[test]
    fn test_no_duplicate_doc_ids_after_repeated_add() {
        let mut attr: PostingListAttribute<WeightedPosting> = PostingListAttribute::new();
        let idx = EnumIndex(0);
        apply_one(&mut attr, idx, change(&[(7, 1)], &[]));
        apply_one(&mut attr, idx, change(&[(7, 2)], &[]));
        assert_eq!(attr.list_len(idx), 1);
        assert_eq!(attr.postings(idx)[0].weight, 2);
    }

    #[test]
    fn test_promotes_to_tree_and_back() {
        let mut attr: PostingListAttribute<DocIdPosting> = PostingListAttribute::new();
        let idx = EnumIndex(3);
        let mut c = PostingChange::new();
        for doc in 1..=(ARRAY_MAX as Lid + 200) {
            c.add(doc, 0);
        }
        apply_one(&mut attr, idx, c);
        assert!(attr.is_tree(idx));
        assert_eq!(attr.list_len(idx), ARRAY_MAX + 200);
        let ids = attr.doc_ids(idx);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        // Shrink below the threshold: representation drops back to array.
        let mut c = PostingChange::new();
        for doc in 1..=(ARRAY_MAX as Lid + 199) {
            c.remove(doc);
        }
        apply_one(&mut attr, idx, c);
        assert!(!attr.is_tree(idx));
        assert_eq!(attr.doc_ids(idx), vec![ARRAY_MAX as Lid + 200]);
    }

    #[test]
    fn test_empty_merge_drops_list() {
        let mut attr: PostingListAttribute<DocIdPosting> = PostingListAttribute::new();
        let idx = EnumIndex(2);
        apply_one(&mut attr, idx, change(&[(4, 0)], &[]));
        assert_eq!(attr.num_lists(), 1);
        apply_one(&mut attr, idx, change(&[], &[4]));
        assert_eq!(attr.num_lists(), 0);
        assert!(attr.postings(idx).is_empty());
    }

    #[test]
    fn test_replaced_memory_goes_through_hold_lists() {
        let mut attr: PostingListAttribute<DocIdPosting> = PostingListAttribute::new();
        let idx = EnumIndex(0);
        apply_one(&mut attr, idx, change(&[(1, 0), (2, 0)], &[]));
        apply_one(&mut attr, idx, change(&[(3, 0)], &[]));
        // Old run freed, new run live; reclaim and keep going.
        attr.transfer_hold_lists(1);
        attr.trim_hold_lists(2);
        assert_eq!(attr.doc_ids(idx), vec![1, 2, 3]);
    }

    #[test]
    fn test_independent_enum_values() {
        let mut attr: PostingListAttribute<DocIdPosting> = PostingListAttribute::new();
        let mut map = BTreeMap::new();
        map.insert(EnumIndex(0), change(&[(1, 0)], &[]));
        map.insert(EnumIndex(1), change(&[(2, 0), (9, 0)], &[]));
        attr.apply(map);
        assert_eq!(attr.doc_ids(EnumIndex(0)), vec![1]);
        assert_eq!(attr.doc_ids(EnumIndex(1)), vec![2, 9]);
    }
}
