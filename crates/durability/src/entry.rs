//! Transaction-log entry envelope.
//!
//! ```text
//! +----------------+
//! | Length (u32)   |  Bytes after this field (kind+serial+payload+crc)
//! +----------------+
//! | Kind (u8)      |  Operation kind
//! +----------------+
//! | Serial (u64)   |  Serial number, little-endian
//! +----------------+
//! | Payload        |  Self-describing operation bytes
//! +----------------+
//! | CRC32 (u32)    |  Checksum of kind + serial + payload
//! +----------------+
//! ```
//!
//! The envelope is self-validating: the CRC detects corruption and the
//! length field frames entries in a segment stream.

use lodestone_core::SerialNum;
use thiserror::Error;

/// Fixed envelope overhead after the length field: kind + serial + crc.
const FIXED_AFTER_LEN: usize = 1 + 8 + 4;

/// Largest accepted entry payload (64 MiB).
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// The operation kind stored with every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpKind {
    /// Full document write.
    Put = 1,
    /// Partial document update.
    Update = 2,
    /// Document removal.
    Remove = 3,
    /// Document move between sub-DBs.
    Move = 4,
    /// Batched removal of tombstone lids.
    PruneRemovedDocuments = 5,
    /// No-op marker (serial placeholder).
    Noop = 6,
    /// Config change marker.
    NewConfig = 7,
    /// History wipe marker.
    WipeHistory = 8,
    /// Idle commit-horizon advance.
    Heartbeat = 9,
}

impl OpKind {
    /// Decode from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Update),
            3 => Some(OpKind::Remove),
            4 => Some(OpKind::Move),
            5 => Some(OpKind::PruneRemovedDocuments),
            6 => Some(OpKind::Noop),
            7 => Some(OpKind::NewConfig),
            8 => Some(OpKind::WipeHistory),
            9 => Some(OpKind::Heartbeat),
            _ => None,
        }
    }

    /// Stable name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Update => "update",
            OpKind::Remove => "remove",
            OpKind::Move => "move",
            OpKind::PruneRemovedDocuments => "prune_removed_documents",
            OpKind::Noop => "noop",
            OpKind::NewConfig => "new_config",
            OpKind::WipeHistory => "wipe_history",
            OpKind::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from entry encoding and decoding.
#[derive(Debug, Error)]
pub enum TlsEntryError {
    /// The buffer ended before a whole entry.
    #[error("entry truncated: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes needed.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The length field exceeds the maximum payload.
    #[error("entry too large: {size} bytes (max {max})")]
    TooLarge {
        /// Declared size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// Stored and computed checksums disagree.
    #[error("entry checksum mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Unknown operation kind byte.
    #[error("unknown entry kind {0}")]
    UnknownKind(u8),
}

/// One transaction-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsEntry {
    /// The entry's serial number.
    pub serial: SerialNum,
    /// The operation kind.
    pub kind: OpKind,
    /// Self-describing operation payload.
    pub payload: Vec<u8>,
}

impl TlsEntry {
    /// Construct an entry.
    pub fn new(serial: SerialNum, kind: OpKind, payload: Vec<u8>) -> Self {
        TlsEntry {
            serial,
            kind,
            payload,
        }
    }

    /// Encode to the wire envelope.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = FIXED_AFTER_LEN + self.payload.len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.serial.to_le_bytes());
        out.extend_from_slice(&self.payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out[4..4 + 1 + 8 + self.payload.len()]);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    /// Decode one entry from the front of `buf`; returns the entry and the
    /// number of bytes consumed.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), TlsEntryError> {
        if buf.len() < 4 {
            return Err(TlsEntryError::Truncated {
                expected: 4,
                actual: buf.len(),
            });
        }
        let body_len = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")) as usize;
        if body_len < FIXED_AFTER_LEN || body_len - FIXED_AFTER_LEN > MAX_PAYLOAD {
            return Err(TlsEntryError::TooLarge {
                size: body_len,
                max: MAX_PAYLOAD,
            });
        }
        let total = 4 + body_len;
        if buf.len() < total {
            return Err(TlsEntryError::Truncated {
                expected: total,
                actual: buf.len(),
            });
        }
        let kind_byte = buf[4];
        let serial = u64::from_le_bytes(buf[5..13].try_into().expect("8 bytes"));
        let payload_len = body_len - FIXED_AFTER_LEN;
        let payload = buf[13..13 + payload_len].to_vec();
        let stored_crc =
            u32::from_le_bytes(buf[total - 4..total].try_into().expect("4 bytes"));
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[4..total - 4]);
        let computed = hasher.finalize();
        if stored_crc != computed {
            return Err(TlsEntryError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed,
            });
        }
        let kind = OpKind::from_u8(kind_byte).ok_or(TlsEntryError::UnknownKind(kind_byte))?;
        Ok((
            TlsEntry {
                serial,
                kind,
                payload,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let entry = TlsEntry::new(42, OpKind::Put, b"payload bytes".to_vec());
        let bytes = entry.to_bytes();
        let (decoded, consumed) = TlsEntry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let entry = TlsEntry::new(1, OpKind::Noop, Vec::new());
        let (decoded, _) = TlsEntry::from_bytes(&entry.to_bytes()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let entry = TlsEntry::new(7, OpKind::Remove, b"abcdef".to_vec());
        let mut bytes = entry.to_bytes();
        bytes[15] ^= 0xff;
        match TlsEntry::from_bytes(&bytes) {
            Err(TlsEntryError::ChecksumMismatch { .. }) => {}
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_buffer() {
        let entry = TlsEntry::new(7, OpKind::Update, b"abc".to_vec());
        let bytes = entry.to_bytes();
        assert!(matches!(
            TlsEntry::from_bytes(&bytes[..bytes.len() - 1]),
            Err(TlsEntryError::Truncated { .. })
        ));
        assert!(matches!(
            TlsEntry::from_bytes(&bytes[..2]),
            Err(TlsEntryError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let entry = TlsEntry::new(7, OpKind::Put, Vec::new());
        let mut bytes = entry.to_bytes();
        // Patch the kind byte and fix up the CRC so only the kind is bad.
        bytes[4] = 200;
        let body_end = bytes.len() - 4;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[4..body_end]);
        let crc = hasher.finalize().to_le_bytes();
        bytes[body_end..].copy_from_slice(&crc);
        assert!(matches!(
            TlsEntry::from_bytes(&bytes),
            Err(TlsEntryError::UnknownKind(200))
        ));
    }

    #[test]
    fn test_kind_codes_roundtrip() {
        for kind in [
            OpKind::Put,
            OpKind::Update,
            OpKind::Remove,
            OpKind::Move,
            OpKind::PruneRemovedDocuments,
            OpKind::Noop,
            OpKind::NewConfig,
            OpKind::WipeHistory,
            OpKind::Heartbeat,
        ] {
            assert_eq!(OpKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(OpKind::from_u8(0), None);
        assert_eq!(OpKind::from_u8(10), None);
    }
}
