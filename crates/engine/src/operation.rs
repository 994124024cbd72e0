//! Feed operation taxonomy.
//!
//! Every mutation flowing through the feed handler is one of these tagged
//! variants. An operation carries a serial number once it has entered the
//! handler (0 means "not yet assigned"). Document operations additionally
//! carry previous-version info filled in by the feed view's `prepare_*`
//! step, which drives the newest-wins outdated check.
//!
//! Operations serialize to self-describing JSON payloads for the
//! transaction log; replay reconstructs them without consulting live
//! schema state.

use lodestone_core::{
    BucketId, DbDocumentId, Document, DocumentId, DocumentUpdate, Lid, SerialNum, SubDbId,
    Timestamp,
};
use lodestone_durability::{OpKind, TlsEntry};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Previous-version info for a document operation, filled by the feed
/// view's prepare step from the document meta store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrevInfo {
    /// Where the document will live.
    pub db_document_id: DbDocumentId,
    /// Where the previous version lives (invalid lid when none).
    pub prev_db_document_id: DbDocumentId,
    /// Timestamp of the previous version (zero when none).
    pub prev_timestamp: Timestamp,
    /// True when the previous version is a tombstone.
    pub prev_marked_as_removed: bool,
}

/// Full document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutOperation {
    /// Assigned serial number (0 until assigned).
    pub serial: SerialNum,
    /// The document to store.
    pub document: Document,
    /// The document's bucket.
    pub bucket: BucketId,
    /// Client timestamp.
    pub timestamp: Timestamp,
    /// Previous-version info.
    pub prev: PrevInfo,
}

impl PutOperation {
    /// Construct an unassigned put.
    pub fn new(bucket: BucketId, timestamp: Timestamp, document: Document) -> Self {
        PutOperation {
            serial: 0,
            document,
            bucket,
            timestamp,
            prev: PrevInfo::default(),
        }
    }
}

/// Partial document update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateOperation {
    /// Assigned serial number (0 until assigned).
    pub serial: SerialNum,
    /// The update to apply.
    pub update: DocumentUpdate,
    /// The document's bucket.
    pub bucket: BucketId,
    /// Client timestamp.
    pub timestamp: Timestamp,
    /// Previous-version info.
    pub prev: PrevInfo,
}

impl UpdateOperation {
    /// Construct an unassigned update.
    pub fn new(bucket: BucketId, timestamp: Timestamp, update: DocumentUpdate) -> Self {
        UpdateOperation {
            serial: 0,
            update,
            bucket,
            timestamp,
            prev: PrevInfo::default(),
        }
    }
}

/// Document removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveOperation {
    /// Assigned serial number (0 until assigned).
    pub serial: SerialNum,
    /// Id of the document to remove.
    pub document_id: DocumentId,
    /// The document's bucket.
    pub bucket: BucketId,
    /// Client timestamp.
    pub timestamp: Timestamp,
    /// Previous-version info.
    pub prev: PrevInfo,
}

impl RemoveOperation {
    /// Construct an unassigned remove.
    pub fn new(bucket: BucketId, timestamp: Timestamp, document_id: DocumentId) -> Self {
        RemoveOperation {
            serial: 0,
            document_id,
            bucket,
            timestamp,
            prev: PrevInfo::default(),
        }
    }
}

/// Document move between sub-DBs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveOperation {
    /// Assigned serial number (0 until assigned).
    pub serial: SerialNum,
    /// The document being moved.
    pub document: Document,
    /// The document's bucket.
    pub bucket: BucketId,
    /// Timestamp carried from the stored document.
    pub timestamp: Timestamp,
    /// Source location.
    pub from: DbDocumentId,
    /// Target location.
    pub to: DbDocumentId,
}

/// Batched removal of tombstone lids from one sub-DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneRemovedDocumentsOperation {
    /// Assigned serial number (0 until assigned).
    pub serial: SerialNum,
    /// The sub-DB holding the tombstones.
    pub sub_db_id: SubDbId,
    /// Lids to drop.
    pub lids: Vec<Lid>,
}

impl PruneRemovedDocumentsOperation {
    /// Construct an empty prune for the removed sub-DB.
    pub fn new() -> Self {
        PruneRemovedDocumentsOperation {
            serial: 0,
            sub_db_id: SubDbId::Removed,
            lids: Vec::new(),
        }
    }

    /// Queue a lid for removal.
    pub fn add_lid(&mut self, lid: Lid) -> &mut Self {
        self.lids.push(lid);
        self
    }

    /// True when no lids are queued.
    pub fn is_empty(&self) -> bool {
        self.lids.is_empty()
    }
}

impl Default for PruneRemovedDocumentsOperation {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutation entering the feed handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedOperation {
    /// Full document write.
    Put(PutOperation),
    /// Partial update.
    Update(UpdateOperation),
    /// Removal.
    Remove(RemoveOperation),
    /// Sub-DB move.
    Move(MoveOperation),
    /// Tombstone pruning.
    PruneRemovedDocuments(PruneRemovedDocumentsOperation),
    /// Serial placeholder.
    Noop {
        /// Assigned serial number.
        serial: SerialNum,
    },
    /// Config change marker; the config itself lives in the config store
    /// keyed by this serial.
    NewConfig {
        /// Assigned serial number (doubles as the config-store key).
        serial: SerialNum,
    },
    /// History wipe marker.
    WipeHistory {
        /// Assigned serial number.
        serial: SerialNum,
    },
    /// Idle commit-horizon advance.
    Heartbeat {
        /// Assigned serial number.
        serial: SerialNum,
    },
}

/// Errors reconstructing operations from log entries.
#[derive(Debug, Error)]
pub enum OperationDecodeError {
    /// The payload did not deserialize.
    #[error("undecodable {kind} payload at serial {serial}: {source}")]
    BadPayload {
        /// Entry kind.
        kind: OpKind,
        /// Entry serial.
        serial: SerialNum,
        /// Underlying serde error.
        source: serde_json::Error,
    },
}

impl FeedOperation {
    /// The operation's kind tag.
    pub fn kind(&self) -> OpKind {
        match self {
            FeedOperation::Put(_) => OpKind::Put,
            FeedOperation::Update(_) => OpKind::Update,
            FeedOperation::Remove(_) => OpKind::Remove,
            FeedOperation::Move(_) => OpKind::Move,
            FeedOperation::PruneRemovedDocuments(_) => OpKind::PruneRemovedDocuments,
            FeedOperation::Noop { .. } => OpKind::Noop,
            FeedOperation::NewConfig { .. } => OpKind::NewConfig,
            FeedOperation::WipeHistory { .. } => OpKind::WipeHistory,
            FeedOperation::Heartbeat { .. } => OpKind::Heartbeat,
        }
    }

    /// The assigned serial number (0 when unassigned).
    pub fn serial_num(&self) -> SerialNum {
        match self {
            FeedOperation::Put(op) => op.serial,
            FeedOperation::Update(op) => op.serial,
            FeedOperation::Remove(op) => op.serial,
            FeedOperation::Move(op) => op.serial,
            FeedOperation::PruneRemovedDocuments(op) => op.serial,
            FeedOperation::Noop { serial }
            | FeedOperation::NewConfig { serial }
            | FeedOperation::WipeHistory { serial }
            | FeedOperation::Heartbeat { serial } => *serial,
        }
    }

    /// Assign the serial number.
    pub fn set_serial_num(&mut self, serial_num: SerialNum) {
        match self {
            FeedOperation::Put(op) => op.serial = serial_num,
            FeedOperation::Update(op) => op.serial = serial_num,
            FeedOperation::Remove(op) => op.serial = serial_num,
            FeedOperation::Move(op) => op.serial = serial_num,
            FeedOperation::PruneRemovedDocuments(op) => op.serial = serial_num,
            FeedOperation::Noop { serial }
            | FeedOperation::NewConfig { serial }
            | FeedOperation::WipeHistory { serial }
            | FeedOperation::Heartbeat { serial } => *serial = serial_num,
        }
    }

    /// The target document id for document operations.
    pub fn document_id(&self) -> Option<&DocumentId> {
        match self {
            FeedOperation::Put(op) => Some(op.document.id()),
            FeedOperation::Update(op) => Some(op.update.id()),
            FeedOperation::Remove(op) => Some(&op.document_id),
            _ => None,
        }
    }

    /// The client timestamp for document operations.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            FeedOperation::Put(op) => Some(op.timestamp),
            FeedOperation::Update(op) => Some(op.timestamp),
            FeedOperation::Remove(op) => Some(op.timestamp),
            FeedOperation::Move(op) => Some(op.timestamp),
            _ => None,
        }
    }

    /// Previous-version info for document operations.
    pub fn prev(&self) -> Option<&PrevInfo> {
        match self {
            FeedOperation::Put(op) => Some(&op.prev),
            FeedOperation::Update(op) => Some(&op.prev),
            FeedOperation::Remove(op) => Some(&op.prev),
            _ => None,
        }
    }

    /// Mutable previous-version info for document operations.
    pub fn prev_mut(&mut self) -> Option<&mut PrevInfo> {
        match self {
            FeedOperation::Put(op) => Some(&mut op.prev),
            FeedOperation::Update(op) => Some(&mut op.prev),
            FeedOperation::Remove(op) => Some(&mut op.prev),
            _ => None,
        }
    }

    /// Newest-wins check: the operation is outdated when the store already
    /// holds a strictly newer version of the document.
    pub fn is_outdated(&self) -> bool {
        match (self.prev(), self.timestamp()) {
            (Some(prev), Some(ts)) => !prev.prev_timestamp.is_zero() && prev.prev_timestamp > ts,
            _ => false,
        }
    }

    /// Encode to a transaction-log entry.
    pub fn to_tls_entry(&self) -> TlsEntry {
        let payload = serde_json::to_vec(self).expect("feed operations serialize");
        TlsEntry::new(self.serial_num(), self.kind(), payload)
    }

    /// Reconstruct from a transaction-log entry. The entry's serial wins
    /// over whatever the payload carries.
    pub fn from_tls_entry(entry: &TlsEntry) -> Result<Self, OperationDecodeError> {
        let mut op: FeedOperation = serde_json::from_slice(&entry.payload).map_err(|source| {
            OperationDecodeError::BadPayload {
                kind: entry.kind,
                serial: entry.serial,
                source,
            }
        })?;
        op.set_serial_num(entry.serial);
        Ok(op)
    }
}
