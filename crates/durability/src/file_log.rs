//! Segmented file-backed transaction log.
//!
//! Entries are appended to segment files `tls-NNNNNN.seg` under the log
//! directory, rotating when a segment exceeds the configured size. Closed
//! segments are immutable. A small JSON side file carries the prune
//! watermark and survives restarts.
//!
//! On open, segments are scanned to recover serial ranges. A torn tail in
//! the newest segment (partial last write) is truncated; corruption in an
//! older, supposedly immutable segment is an error.

use crate::config::{DurabilityMode, TransLogConfig};
use crate::entry::{TlsEntry, TlsEntryError};
use crate::{TlsError, TransLog};
use lodestone_core::SerialNum;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

const META_FILE: &str = "tls.meta";

#[derive(Debug, Serialize, Deserialize, Default)]
struct LogMeta {
    pruned_serial: SerialNum,
}

#[derive(Debug)]
struct SegmentMeta {
    number: u64,
    first_serial: SerialNum,
    last_serial: SerialNum,
    size: u64,
}

/// File-backed [`TransLog`].
pub struct FileTransLog {
    dir: PathBuf,
    config: TransLogConfig,
    segments: Vec<SegmentMeta>,
    current_file: Option<File>,
    last_serial: SerialNum,
    pruned_serial: SerialNum,
    writes_since_sync: usize,
    last_sync_time: Instant,
}

impl FileTransLog {
    /// Open (or create) a log in `dir`.
    pub fn open(dir: impl Into<PathBuf>, config: TransLogConfig) -> Result<Self, TlsError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let meta = Self::load_meta(&dir)?;
        let mut numbers = Self::list_segment_numbers(&dir)?;
        numbers.sort_unstable();
        let mut segments = Vec::new();
        let mut last_serial = meta.pruned_serial;
        let count = numbers.len();
        for (i, number) in numbers.into_iter().enumerate() {
            let is_newest = i + 1 == count;
            let segment = Self::scan_segment(&dir, number, is_newest)?;
            last_serial = last_serial.max(segment.last_serial);
            segments.push(segment);
        }
        debug!(
            dir = %dir.display(),
            segments = segments.len(),
            last_serial,
            pruned = meta.pruned_serial,
            "opened transaction log"
        );
        Ok(FileTransLog {
            dir,
            config,
            segments,
            current_file: None,
            last_serial,
            pruned_serial: meta.pruned_serial,
            writes_since_sync: 0,
            last_sync_time: Instant::now(),
        })
    }

    fn segment_path(dir: &Path, number: u64) -> PathBuf {
        dir.join(format!("tls-{:06}.seg", number))
    }

    fn list_segment_numbers(dir: &Path) -> Result<Vec<u64>, TlsError> {
        let mut numbers = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let name = dirent?.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_prefix("tls-").and_then(|n| n.strip_suffix(".seg")) {
                if let Ok(number) = stem.parse::<u64>() {
                    numbers.push(number);
                }
            }
        }
        Ok(numbers)
    }

    fn load_meta(dir: &Path) -> Result<LogMeta, TlsError> {
        let path = dir.join(META_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LogMeta::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_meta(&self) -> Result<(), TlsError> {
        let meta = LogMeta {
            pruned_serial: self.pruned_serial,
        };
        let bytes = serde_json::to_vec(&meta).expect("meta serializes");
        std::fs::write(self.dir.join(META_FILE), bytes)?;
        Ok(())
    }

    fn scan_segment(dir: &Path, number: u64, is_newest: bool) -> Result<SegmentMeta, TlsError> {
        let path = Self::segment_path(dir, number);
        let mut bytes = Vec::new();
        File::open(&path)?.read_to_end(&mut bytes)?;
        let mut offset = 0usize;
        let mut first_serial = 0;
        let mut last_serial = 0;
        while offset < bytes.len() {
            match TlsEntry::from_bytes(&bytes[offset..]) {
                Ok((entry, consumed)) => {
                    if first_serial == 0 {
                        first_serial = entry.serial;
                    }
                    last_serial = entry.serial;
                    offset += consumed;
                }
                Err(TlsEntryError::Truncated { .. }) if is_newest => {
                    // Torn tail from an interrupted append: drop it.
                    warn!(
                        segment = number,
                        valid_bytes = offset,
                        "truncating torn tail of newest segment"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(offset as u64)?;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(SegmentMeta {
            number,
            first_serial,
            last_serial,
            size: offset as u64,
        })
    }

    fn open_current(&mut self) -> Result<(), TlsError> {
        if self.current_file.is_some() {
            return Ok(());
        }
        let number = match self.segments.last() {
            Some(segment) => segment.number,
            None => {
                self.segments.push(SegmentMeta {
                    number: 1,
                    first_serial: 0,
                    last_serial: 0,
                    size: 0,
                });
                1
            }
        };
        let path = Self::segment_path(&self.dir, number);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.current_file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), TlsError> {
        if let Some(file) = self.current_file.take() {
            file.sync_all()?;
        }
        let next = self.segments.last().map(|s| s.number + 1).unwrap_or(1);
        self.segments.push(SegmentMeta {
            number: next,
            first_serial: 0,
            last_serial: 0,
            size: 0,
        });
        let path = Self::segment_path(&self.dir, next);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.current_file = Some(file);
        debug!(segment = next, "rotated transaction log segment");
        Ok(())
    }

    fn maybe_sync(&mut self) -> Result<(), TlsError> {
        match self.config.durability {
            DurabilityMode::Strict => {
                if let Some(file) = &self.current_file {
                    file.sync_all()?;
                }
                self.writes_since_sync = 0;
                self.last_sync_time = Instant::now();
            }
            DurabilityMode::Batched {
                interval_ms,
                batch_size,
            } => {
                let due = self.writes_since_sync >= batch_size
                    || self.last_sync_time.elapsed().as_millis() as u64 >= interval_ms;
                if due {
                    if let Some(file) = &self.current_file {
                        file.sync_all()?;
                    }
                    self.writes_since_sync = 0;
                    self.last_sync_time = Instant::now();
                }
            }
            DurabilityMode::None => {}
        }
        Ok(())
    }

    /// Segment count, for tests and introspection.
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

impl TransLog for FileTransLog {
    fn store_entry(&mut self, entry: &TlsEntry) -> Result<(), TlsError> {
        if entry.serial <= self.last_serial {
            return Err(TlsError::NonMonotonicSerial {
                serial: entry.serial,
                last: self.last_serial,
            });
        }
        self.open_current()?;
        let bytes = entry.to_bytes();
        {
            let current = self.segments.last().expect("open_current pushed a segment");
            if current.size > 0 && current.size + bytes.len() as u64 > self.config.segment_size {
                self.rotate()?;
            }
        }
        let file = self.current_file.as_mut().expect("current file open");
        file.write_all(&bytes)?;
        let current = self.segments.last_mut().expect("segment exists");
        if current.first_serial == 0 {
            current.first_serial = entry.serial;
        }
        current.last_serial = entry.serial;
        current.size += bytes.len() as u64;
        self.last_serial = entry.serial;
        self.writes_since_sync += 1;
        self.maybe_sync()
    }

    fn erase(&mut self, serial: SerialNum) -> bool {
        if serial > self.last_serial {
            return false;
        }
        if serial <= self.pruned_serial {
            return true;
        }
        self.pruned_serial = serial;
        // Drop fully covered segments, never the newest one (it is the
        // append target).
        let mut kept = Vec::new();
        let count = self.segments.len();
        for (i, segment) in self.segments.drain(..).enumerate() {
            let fully_pruned =
                segment.last_serial != 0 && segment.last_serial <= serial && i + 1 < count;
            if fully_pruned {
                let path = Self::segment_path(&self.dir, segment.number);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(segment = segment.number, error = %e, "failed to remove pruned segment");
                }
            } else {
                kept.push(segment);
            }
        }
        self.segments = kept;
        if let Err(e) = self.save_meta() {
            warn!(error = %e, "failed to persist prune watermark");
        }
        true
    }

    fn sync(&mut self, _sync_to: SerialNum) -> Result<SerialNum, TlsError> {
        if let Some(file) = &self.current_file {
            file.sync_all()?;
        }
        self.writes_since_sync = 0;
        self.last_sync_time = Instant::now();
        Ok(self.last_serial)
    }

    fn visit(
        &mut self,
        from_exclusive: SerialNum,
        to_inclusive: SerialNum,
        visitor: &mut dyn FnMut(&TlsEntry),
    ) -> Result<(), TlsError> {
        if let Some(file) = &mut self.current_file {
            file.flush()?;
        }
        let floor = from_exclusive.max(self.pruned_serial);
        for i in 0..self.segments.len() {
            let (number, first, last) = {
                let s = &self.segments[i];
                (s.number, s.first_serial, s.last_serial)
            };
            if last == 0 || last <= floor || (first > to_inclusive && first != 0) {
                continue;
            }
            let path = Self::segment_path(&self.dir, number);
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            let mut offset = 0usize;
            while offset < bytes.len() {
                let (entry, consumed) = TlsEntry::from_bytes(&bytes[offset..])?;
                offset += consumed;
                if entry.serial > floor && entry.serial <= to_inclusive {
                    visitor(&entry);
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::OpKind;
    use tempfile::tempdir;

    fn entry(serial: SerialNum) -> TlsEntry {
        TlsEntry::new(serial, OpKind::Put, format!("doc-{serial}").into_bytes())
    }

    fn collect(log: &mut FileTransLog, from: SerialNum, to: SerialNum) -> Vec<SerialNum> {
        let mut serials = Vec::new();
        log.visit(from, to, &mut |e| serials.push(e.serial)).unwrap();
        serials
    }

    #[test]
    fn test_append_and_visit() {
        let dir = tempdir().unwrap();
        let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
        for serial in 1..=5 {
            log.store_entry(&entry(serial)).unwrap();
        }
        assert_eq!(log.last_serial(), 5);
        assert_eq!(collect(&mut log, 0, 5), vec![1, 2, 3, 4, 5]);
        assert_eq!(collect(&mut log, 2, 4), vec![3, 4]);
    }

    #[test]
    fn test_non_monotonic_append_rejected() {
        let dir = tempdir().unwrap();
        let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
        log.store_entry(&entry(3)).unwrap();
        assert!(matches!(
            log.store_entry(&entry(3)),
            Err(TlsError::NonMonotonicSerial { serial: 3, last: 3 })
        ));
        assert!(matches!(
            log.store_entry(&entry(2)),
            Err(TlsError::NonMonotonicSerial { .. })
        ));
    }

    #[test]
    fn test_rotation_by_segment_size() {
        let dir = tempdir().unwrap();
        let config = TransLogConfig::for_testing().with_segment_size(64);
        let mut log = FileTransLog::open(dir.path(), config).unwrap();
        for serial in 1..=20 {
            log.store_entry(&entry(serial)).unwrap();
        }
        assert!(log.num_segments() > 1, "should have rotated");
        assert_eq!(collect(&mut log, 0, 20).len(), 20);
    }

    #[test]
    fn test_reopen_resumes_serials() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
            for serial in 1..=3 {
                log.store_entry(&entry(serial)).unwrap();
            }
            log.sync(3).unwrap();
        }
        let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
        assert_eq!(log.last_serial(), 3);
        log.store_entry(&entry(4)).unwrap();
        assert_eq!(collect(&mut log, 0, 10), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_erase_drops_segments_and_persists_watermark() {
        let dir = tempdir().unwrap();
        let config = TransLogConfig::for_testing().with_segment_size(64);
        {
            let mut log = FileTransLog::open(dir.path(), config.clone()).unwrap();
            for serial in 1..=20 {
                log.store_entry(&entry(serial)).unwrap();
            }
            let before = log.num_segments();
            assert!(log.erase(10));
            assert!(log.num_segments() < before);
            assert_eq!(log.pruned_serial(), 10);
            assert_eq!(collect(&mut log, 0, 20), (11..=20).collect::<Vec<_>>());
        }
        // Watermark survives reopen.
        let mut log = FileTransLog::open(dir.path(), config).unwrap();
        assert_eq!(log.pruned_serial(), 10);
        assert_eq!(collect(&mut log, 0, 20), (11..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_erase_beyond_head_refused() {
        let dir = tempdir().unwrap();
        let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
        log.store_entry(&entry(1)).unwrap();
        assert!(!log.erase(5));
        assert_eq!(log.pruned_serial(), 0);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
            log.store_entry(&entry(1)).unwrap();
            log.store_entry(&entry(2)).unwrap();
            log.sync(2).unwrap();
        }
        // Simulate a torn write at the end of the newest segment.
        let path = FileTransLog::segment_path(dir.path(), 1);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
        assert_eq!(log.last_serial(), 1);
        assert_eq!(collect(&mut log, 0, 10), vec![1]);
        // Appending continues cleanly after the truncation.
        log.store_entry(&entry(2)).unwrap();
        assert_eq!(collect(&mut log, 0, 10), vec![1, 2]);
    }

    #[test]
    fn test_erase_everything_keeps_last_serial() {
        let dir = tempdir().unwrap();
        {
            let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
            for serial in 1..=4 {
                log.store_entry(&entry(serial)).unwrap();
            }
            assert!(log.erase(4));
            assert!(collect(&mut log, 0, 10).is_empty());
        }
        let mut log = FileTransLog::open(dir.path(), TransLogConfig::for_testing()).unwrap();
        // Serial allocation must not restart below the pruned point.
        assert_eq!(log.last_serial(), 4);
        log.store_entry(&entry(5)).unwrap();
        assert_eq!(collect(&mut log, 0, 10), vec![5]);
    }
}
