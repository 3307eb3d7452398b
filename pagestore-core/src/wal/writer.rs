//! WAL writer implementation

use super::{list_segments, segment_file_name, SyncPolicy, WalConfig, WalEntry};
use crate::{Lsn, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

/// WAL writer for appending entries to disk
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_start: Lsn,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Open a writer whose first entry will be at or after `start_lsn`
    ///
    /// Must be called after replay: a segment already named `start_lsn`
    /// holds no valid entries and is truncated.
    pub fn new(config: WalConfig, start_lsn: Lsn) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let file = Self::create_segment(&config.dir, start_lsn)?;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_start: start_lsn,
            bytes_written: 0,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Append an entry to the WAL
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        let serialized = entry.serialize_with_checksum();
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0
            && inner.bytes_written + serialized.len() > self.config.segment_size
        {
            self.rotate_locked(&mut inner, entry.lsn)?;
        }

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len();
        inner.writes_since_sync += 1;

        if self.should_sync(&inner) {
            Self::sync_locked(&mut inner)?;
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::sync_locked(&mut inner)
    }

    /// Start a new segment for entries at or after `next_lsn`
    pub fn rotate(&self, next_lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.bytes_written == 0 {
            return Ok(());
        }
        self.rotate_locked(&mut inner, next_lsn)
    }

    /// Start LSN of the segment currently written
    pub fn current_segment(&self) -> Lsn {
        self.inner.lock().segment_start
    }

    /// Remove segments whose entries are all at or below `disk_consistent_lsn`
    pub fn truncate(&self, disk_consistent_lsn: Lsn) -> Result<usize> {
        let current = self.current_segment();
        let segments = list_segments(&self.config.dir)?;
        let mut removed = 0;
        for pair in segments.windows(2) {
            let (start, path) = &pair[0];
            let (next_start, _) = &pair[1];
            if *start >= current {
                break;
            }
            if *next_start <= disk_consistent_lsn.next() {
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(
                "Truncated {} WAL segments up to {} in {:?}",
                removed, disk_consistent_lsn, self.config.dir
            );
        }
        Ok(removed)
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn sync_locked(inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut WalWriterInner, next_lsn: Lsn) -> Result<()> {
        Self::sync_locked(inner)?;

        let file = Self::create_segment(&self.config.dir, next_lsn)?;
        inner.file = BufWriter::new(file);
        inner.segment_start = next_lsn;
        inner.bytes_written = 0;
        inner.writes_since_sync = 0;
        Ok(())
    }

    fn create_segment(dir: &Path, start_lsn: Lsn) -> Result<File> {
        let path = dir.join(segment_file_name(start_lsn));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        crate::crashsafe::fsync_dir(dir)?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Delta, Key};
    use tempfile::TempDir;

    fn entry(lsn: u64) -> WalEntry {
        WalEntry::ingest(Lsn(lsn), &[Delta::put(Key::new(1, 1, lsn as u32), vec![0u8; 64])]).unwrap()
    }

    #[test]
    fn test_wal_writer_rotates_segments() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
            segment_size: 256,
        };

        let writer = WalWriter::new(config, Lsn(1)).unwrap();
        for lsn in 1..=10 {
            writer.append(&entry(lsn)).unwrap();
        }
        writer.sync().unwrap();

        let segments = list_segments(temp_dir.path()).unwrap();
        assert!(segments.len() > 1);
        assert_eq!(segments[0].0, Lsn(1));
        assert_eq!(segments.last().unwrap().0, writer.current_segment());
    }

    #[test]
    fn test_truncate_keeps_unflushed_entries() {
        let temp_dir = TempDir::new().unwrap();
        let writer = WalWriter::new(WalConfig::new(temp_dir.path().to_path_buf()), Lsn(1)).unwrap();

        for lsn in 1..=5 {
            writer.append(&entry(lsn)).unwrap();
        }
        writer.rotate(Lsn(6)).unwrap();
        for lsn in 6..=8 {
            writer.append(&entry(lsn)).unwrap();
        }

        // 1..=4 on disk: the first segment still holds 5
        assert_eq!(writer.truncate(Lsn(4)).unwrap(), 0);
        assert_eq!(writer.truncate(Lsn(5)).unwrap(), 1);

        let segments = list_segments(temp_dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, Lsn(6));
    }
}
