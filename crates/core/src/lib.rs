//! Core types for the lodestone search index node.
//!
//! This crate holds the vocabulary shared by every other layer:
//! - Identifiers: serial numbers, document ids, global ids, buckets, lids
//! - The document model: schema, document type repo, documents, updates
//! - The error taxonomy surfaced to feed clients
//!
//! Nothing here does I/O; the types are plain data with serde support so
//! the durability layer can persist them without consulting schema state.

#![warn(missing_docs)]

pub mod document;
pub mod error;
pub mod types;

pub use document::{
    Document, DocumentType, DocumentTypeRepo, DocumentUpdate, FieldKind, FieldUpdate, FieldValue,
    Schema, TensorType,
};
pub use error::{CoreError, ErrorType};
pub use types::{
    BucketId, DbDocumentId, DocTypeName, DocumentId, Generation, GlobalId, Lid, SerialNum,
    SubDbId, Timestamp, RESERVED_LID,
};
