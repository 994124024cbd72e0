//! lodestone: a per-document-type search index node core.
//!
//! Facade over the workspace crates:
//! - [`lodestone_core`]: identifiers, document model, error taxonomy
//! - [`lodestone_store`]: arena data store with generation-based
//!   reclamation, enum store, posting lists
//! - [`lodestone_durability`]: the durable transaction log
//! - [`lodestone_engine`]: feed handler, DocumentDB lifecycle, write
//!   service, maintenance
//!
//! The typical embedding constructs a
//! [`DocumentDb`](lodestone_engine::DocumentDb) per served document
//! type, starts it, and feeds operations through its feed handler.

pub use lodestone_core as base;
pub use lodestone_durability as durability;
pub use lodestone_engine as engine;
pub use lodestone_store as store;

pub use lodestone_core::{
    BucketId, DbDocumentId, DocTypeName, Document, DocumentId, DocumentTypeRepo, DocumentUpdate,
    ErrorType, GlobalId, SerialNum, SubDbId, Timestamp,
};
pub use lodestone_durability::{FileTransLog, MemTransLog, TransLog, TransLogConfig};
pub use lodestone_engine::{
    DocumentDb, DocumentDbConfig, DocumentDbParams, FeedHandler, FeedOperation, FeedResult,
    FeedToken, FeedView, StatusReport,
};
