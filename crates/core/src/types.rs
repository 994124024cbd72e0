//! Identifier types shared across the node.
//!
//! A document is addressed three ways depending on the layer:
//! - `DocumentId`: the client-visible string id (`id:<ns>:<type>::<local>`)
//! - `GlobalId`: a fixed 12-byte content-derived id used by the meta store
//! - `DbDocumentId`: `(sub-db, lid)` saying where the document lives now
//!
//! Serial numbers order every durable mutation; buckets partition the
//! document space for distribution and maintenance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Monotone per-DocumentDB version counter for durable operations.
///
/// Every committed mutation carries exactly one serial number; gaps are
/// forbidden during live operation and replay iterates in ascending order.
pub type SerialNum = u64;

/// Epoch counter used by the generation-based reclamation scheme.
pub type Generation = u64;

/// Local document id: a dense index into per-sub-DB arrays.
pub type Lid = u32;

/// Lid 0 is never assigned to a document.
pub const RESERVED_LID: Lid = 0;

// ============================================================================
// Timestamp
// ============================================================================

/// Client-supplied microsecond timestamp used for newest-wins conflict
/// resolution between feed operations.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Microseconds since the epoch.
    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// True for the zero timestamp, meaning "no previous version known".
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(micros: u64) -> Self {
        Timestamp(micros)
    }
}

// ============================================================================
// Document type name
// ============================================================================

/// Name of a document type, e.g. `music`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocTypeName(String);

impl DocTypeName {
    /// Wrap a document type name.
    pub fn new(name: impl Into<String>) -> Self {
        DocTypeName(name.into())
    }

    /// The type name as a str.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// DocumentId
// ============================================================================

/// Client-visible document id on the form `id:<namespace>:<doctype>::<local>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    namespace: String,
    doc_type: String,
    local: String,
}

impl DocumentId {
    /// Parse an id string. The scheme must be `id` and the separator between
    /// the type and the local part is a literal `::`.
    pub fn parse(input: &str) -> Result<Self, crate::error::CoreError> {
        let rest = input
            .strip_prefix("id:")
            .ok_or_else(|| crate::error::CoreError::InvalidDocumentId {
                input: input.to_string(),
            })?;
        let (namespace, rest) =
            rest.split_once(':')
                .ok_or_else(|| crate::error::CoreError::InvalidDocumentId {
                    input: input.to_string(),
                })?;
        let (doc_type, local) =
            rest.split_once("::")
                .ok_or_else(|| crate::error::CoreError::InvalidDocumentId {
                    input: input.to_string(),
                })?;
        if namespace.is_empty() || doc_type.is_empty() {
            return Err(crate::error::CoreError::InvalidDocumentId {
                input: input.to_string(),
            });
        }
        Ok(DocumentId {
            namespace: namespace.to_string(),
            doc_type: doc_type.to_string(),
            local: local.to_string(),
        })
    }

    /// The namespace component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The document type component.
    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// The local id component (may be empty).
    pub fn local(&self) -> &str {
        &self.local
    }

    /// Derive the content-addressed global id for this document id.
    pub fn global_id(&self) -> GlobalId {
        GlobalId::from_document_id(self)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id:{}:{}::{}", self.namespace, self.doc_type, self.local)
    }
}

// ============================================================================
// GlobalId
// ============================================================================

/// Number of bytes in a global id.
pub const GLOBAL_ID_LEN: usize = 12;

/// Opaque 12-byte content-addressed document identifier.
///
/// Derived from the document id string; the hash bucket for a document is
/// in turn derived from this. Ordering is plain lexicographic byte order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GlobalId([u8; GLOBAL_ID_LEN]);

impl GlobalId {
    /// Construct from raw bytes.
    pub fn new(bytes: [u8; GLOBAL_ID_LEN]) -> Self {
        GlobalId(bytes)
    }

    /// Derive from a document id: the first 12 bytes of SHA-256 over the
    /// id's string form.
    pub fn from_document_id(id: &DocumentId) -> Self {
        let digest = Sha256::digest(id.to_string().as_bytes());
        let mut bytes = [0u8; GLOBAL_ID_LEN];
        bytes.copy_from_slice(&digest[..GLOBAL_ID_LEN]);
        GlobalId(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; GLOBAL_ID_LEN] {
        &self.0
    }

    /// The low 64 bits of the id, used for bucket derivation.
    pub fn low_u64(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().expect("gid has 12 bytes"))
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// BucketId
// ============================================================================

/// Default number of significant bits when deriving a bucket from a gid.
pub const DEFAULT_BUCKET_BITS: u32 = 8;

/// Hash bucket for a document, derived from its global id.
///
/// Encoding: the top 6 bits hold the used-bit count, the low bits hold the
/// key masked to that many bits. A bucket with fewer used bits contains
/// every bucket that shares its prefix.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BucketId(u64);

impl BucketId {
    const USED_SHIFT: u32 = 58;

    /// Construct from a used-bit count and raw key.
    pub fn new(used_bits: u32, key: u64) -> Self {
        debug_assert!(used_bits > 0 && used_bits <= Self::USED_SHIFT);
        let mask = if used_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << used_bits) - 1
        };
        BucketId(((used_bits as u64) << Self::USED_SHIFT) | (key & mask))
    }

    /// Derive the bucket for a global id using the default bit count.
    pub fn from_gid(gid: &GlobalId) -> Self {
        BucketId::new(DEFAULT_BUCKET_BITS, gid.low_u64())
    }

    /// The number of significant key bits.
    pub fn used_bits(&self) -> u32 {
        (self.0 >> Self::USED_SHIFT) as u32
    }

    /// The key masked to the used bits.
    pub fn key(&self) -> u64 {
        let used = self.used_bits();
        if used == 0 {
            return 0;
        }
        self.0 & ((1u64 << used) - 1)
    }

    /// The raw encoded value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// True when `other` falls inside this bucket: this bucket uses no more
    /// bits than `other` and the keys agree on those bits.
    pub fn contains(&self, other: &BucketId) -> bool {
        let used = self.used_bits();
        if used == 0 || used > other.used_bits() {
            return false;
        }
        let mask = (1u64 << used) - 1;
        (other.key() & mask) == self.key()
    }

    /// True for the default-constructed, unusable bucket.
    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket({}:0x{:x})", self.used_bits(), self.key())
    }
}

// ============================================================================
// Sub-DB addressing
// ============================================================================

/// The three sub-databases a DocumentDB partitions its documents over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubDbId {
    /// Indexed and searchable documents.
    Ready = 0,
    /// Stored but not indexed documents.
    NotReady = 1,
    /// Tombstones kept for eventual pruning.
    Removed = 2,
}

impl SubDbId {
    /// Numeric id used in `DbDocumentId` encoding and TLS payloads.
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Decode from the numeric id.
    pub fn from_u32(id: u32) -> Option<Self> {
        match id {
            0 => Some(SubDbId::Ready),
            1 => Some(SubDbId::NotReady),
            2 => Some(SubDbId::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for SubDbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubDbId::Ready => "ready",
            SubDbId::NotReady => "notready",
            SubDbId::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Where a document currently lives: a sub-DB plus its lid there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbDocumentId {
    /// Which sub-DB holds the document.
    pub sub_db_id: SubDbId,
    /// The document's lid within that sub-DB.
    pub lid: Lid,
}

impl DbDocumentId {
    /// Construct from parts.
    pub fn new(sub_db_id: SubDbId, lid: Lid) -> Self {
        DbDocumentId { sub_db_id, lid }
    }

    /// True when the lid is the reserved "no document" lid.
    pub fn valid(&self) -> bool {
        self.lid != RESERVED_LID
    }
}

impl Default for DbDocumentId {
    fn default() -> Self {
        DbDocumentId::new(SubDbId::Ready, RESERVED_LID)
    }
}

impl fmt::Display for DbDocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sub_db_id, self.lid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_parse_roundtrip() {
        let id = DocumentId::parse("id:music:song::love-me-do").unwrap();
        assert_eq!(id.namespace(), "music");
        assert_eq!(id.doc_type(), "song");
        assert_eq!(id.local(), "love-me-do");
        assert_eq!(id.to_string(), "id:music:song::love-me-do");
    }

    #[test]
    fn test_document_id_empty_local_part() {
        let id = DocumentId::parse("id:ns:t::").unwrap();
        assert_eq!(id.local(), "");
    }

    #[test]
    fn test_document_id_rejects_malformed() {
        assert!(DocumentId::parse("doc:ns:t::x").is_err());
        assert!(DocumentId::parse("id:nst::x").is_err());
        assert!(DocumentId::parse("id:ns:t:x").is_err());
        assert!(DocumentId::parse("id::t::x").is_err());
    }

    #[test]
    fn test_global_id_is_stable_and_distinct() {
        let a = DocumentId::parse("id:ns:t::a").unwrap().global_id();
        let a2 = DocumentId::parse("id:ns:t::a").unwrap().global_id();
        let b = DocumentId::parse("id:ns:t::b").unwrap().global_id();
        assert_eq!(a, a2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_bucket_from_gid_uses_default_bits() {
        let gid = DocumentId::parse("id:ns:t::a").unwrap().global_id();
        let bucket = BucketId::from_gid(&gid);
        assert_eq!(bucket.used_bits(), DEFAULT_BUCKET_BITS);
        assert_eq!(bucket.key(), gid.low_u64() & 0xff);
    }

    #[test]
    fn test_bucket_contains_by_prefix() {
        let coarse = BucketId::new(4, 0b1010);
        let fine = BucketId::new(8, 0b0101_1010);
        let other = BucketId::new(8, 0b0101_0110);
        assert!(coarse.contains(&fine));
        assert!(!coarse.contains(&other));
        assert!(!fine.contains(&coarse));
        // A bucket contains itself.
        assert!(coarse.contains(&coarse));
    }

    #[test]
    fn test_db_document_id_validity() {
        assert!(!DbDocumentId::default().valid());
        assert!(DbDocumentId::new(SubDbId::Removed, 7).valid());
    }

    #[test]
    fn test_sub_db_id_roundtrip() {
        for sub_db in [SubDbId::Ready, SubDbId::NotReady, SubDbId::Removed] {
            assert_eq!(SubDbId::from_u32(sub_db.as_u32()), Some(sub_db));
        }
        assert_eq!(SubDbId::from_u32(3), None);
    }
}
