//! In-memory transaction log for tests and single-process setups.

use crate::entry::TlsEntry;
use crate::{TlsError, TransLog};
use lodestone_core::SerialNum;

/// Vec-backed [`TransLog`]. Same contract as the file log, no I/O.
#[derive(Default)]
pub struct MemTransLog {
    entries: Vec<TlsEntry>,
    last_serial: SerialNum,
    pruned_serial: SerialNum,
}

impl MemTransLog {
    /// An empty log.
    pub fn new() -> Self {
        MemTransLog::default()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TransLog for MemTransLog {
    fn store_entry(&mut self, entry: &TlsEntry) -> Result<(), TlsError> {
        if entry.serial <= self.last_serial {
            return Err(TlsError::NonMonotonicSerial {
                serial: entry.serial,
                last: self.last_serial,
            });
        }
        self.entries.push(entry.clone());
        self.last_serial = entry.serial;
        Ok(())
    }

    fn erase(&mut self, serial: SerialNum) -> bool {
        if serial > self.last_serial {
            return false;
        }
        if serial > self.pruned_serial {
            self.pruned_serial = serial;
            self.entries.retain(|e| e.serial > serial);
        }
        true
    }

    fn sync(&mut self, _sync_to: SerialNum) -> Result<SerialNum, TlsError> {
        Ok(self.last_serial)
    }

    fn visit(
        &mut self,
        from_exclusive: SerialNum,
        to_inclusive: SerialNum,
        visitor: &mut dyn FnMut(&TlsEntry),
    ) -> Result<(), TlsError> {
        let floor = from_exclusive.max(self.pruned_serial);
        for entry in &self.entries {
            if entry.serial > floor && entry.serial <= to_inclusive {
                visitor(entry);
            }
        }
        Ok(())
    }

    fn last_serial(&self) -> SerialNum {
        self.last_serial
    }

    fn pruned_serial(&self) -> SerialNum {
        self.pruned_serial
    }
}
