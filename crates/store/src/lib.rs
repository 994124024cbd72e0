//! Arena data store with generation-based reclamation.
//!
//! This crate is the substrate the in-memory index structures are built
//! on:
//! - `generation`: epoch handler; readers pin a generation, the writer
//!   advances it on commit, memory tagged with an old generation is
//!   reclaimed once every reader has moved past it
//! - `datastore`: typed arena buffers addressed by 32-bit `EntryRef`,
//!   with two-stage hold lists, free lists and compaction
//! - `enum_store`: value interning with refcounts on top of the datastore
//! - `posting`: posting-list attribute mapping enum indexes to sorted
//!   doc-id lists, with batched change application
//!
//! The writer side is single-threaded by contract (one writer thread per
//! attribute structure); the generation machinery makes logically freed
//! memory stay dereferenceable until every pinned reader generation has
//! moved past the free.

#![warn(missing_docs)]

pub mod datastore;
pub mod enum_store;
pub mod generation;
pub mod posting;

pub use datastore::{DataStore, DataStoreConfig, EntryRef, MemStats, TypeId};
pub use enum_store::{EnumIndex, EnumStore};
pub use generation::{GenerationGuard, GenerationHandler};
pub use posting::{DocIdPosting, Posting, PostingChange, PostingListAttribute, WeightedPosting};
