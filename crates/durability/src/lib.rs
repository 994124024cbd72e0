//! Durable transaction log (TLS) for a DocumentDB.
//!
//! The log is an append-only ordered stream of `(serial, kind, payload)`
//! entries. Payloads are opaque self-describing bytes; the engine
//! reconstructs feed operations from them during replay without
//! consulting live schema state.
//!
//! Two implementations share the [`TransLog`] trait:
//! - [`FileTransLog`]: segmented files with CRC-validated entries,
//!   rotation, fsync policies and pruning
//! - [`MemTransLog`]: in-memory, for tests and single-process setups
//!
//! Serial numbers must strictly ascend across appends; a non-monotonic
//! append is an error the engine treats as fatal.

#![warn(missing_docs)]

pub mod config;
pub mod entry;
pub mod file_log;
pub mod mem_log;

pub use config::{DurabilityMode, TransLogConfig};
pub use entry::{OpKind, TlsEntry, TlsEntryError};
pub use file_log::FileTransLog;
pub use mem_log::MemTransLog;

use lodestone_core::SerialNum;
use thiserror::Error;

/// Errors surfaced by a transaction log.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Underlying file I/O failed.
    #[error("transaction log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored entry failed validation.
    #[error("transaction log entry error: {0}")]
    Entry(#[from] TlsEntryError),

    /// An append would break serial monotonicity.
    #[error("non-monotonic serial {serial} appended after {last}")]
    NonMonotonicSerial {
        /// The offending serial.
        serial: SerialNum,
        /// The last serial in the log.
        last: SerialNum,
    },
}

/// The transaction log contract the engine writes through.
pub trait TransLog: Send {
    /// Append one entry. Serials must strictly ascend.
    fn store_entry(&mut self, entry: &TlsEntry) -> Result<(), TlsError>;

    /// Discard all entries with serial <= `serial`. Returns false when the
    /// log refuses (e.g. pruning past the head); the watermark is then
    /// unchanged.
    fn erase(&mut self, serial: SerialNum) -> bool;

    /// Make everything up to `sync_to` durable; returns the serial the log
    /// is durable through.
    fn sync(&mut self, sync_to: SerialNum) -> Result<SerialNum, TlsError>;

    /// Visit entries with `from_exclusive < serial <= to_inclusive` in
    /// ascending serial order.
    fn visit(
        &mut self,
        from_exclusive: SerialNum,
        to_inclusive: SerialNum,
        visitor: &mut dyn FnMut(&TlsEntry),
    ) -> Result<(), TlsError>;

    /// Serial of the newest stored entry (0 when empty).
    fn last_serial(&self) -> SerialNum;

    /// Serial below which everything has been pruned (0 = nothing pruned).
    fn pruned_serial(&self) -> SerialNum;
}
