//! WAL reader for recovery

use super::{list_segments, WalEntry};
use crate::{Lsn, PageStoreError, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// WAL reader for recovering entries after crash
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Recover all entries with an LSN above `after`, in LSN order
    pub fn recover_after(&self, after: Lsn) -> Result<Vec<WalEntry>> {
        let segments = list_segments(&self.dir)?;
        let mut entries = Vec::new();

        for (i, (_, path)) in segments.iter().enumerate() {
            // every entry of this segment is below the next segment's start
            if let Some((next_start, _)) = segments.get(i + 1) {
                if *next_start <= after.next() {
                    continue;
                }
            }
            let segment_entries = self.read_segment(path)?;
            let before = entries.len();
            entries.extend(segment_entries.into_iter().filter(|e| e.lsn > after));
            if entries.len() > before {
                info!(
                    "Recovered {} entries from {:?}",
                    entries.len() - before,
                    path
                );
            }
        }

        entries.sort_by_key(|e| e.lsn);
        Ok(entries)
    }

    fn read_segment(&self, path: &Path) -> Result<Vec<WalEntry>> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok((entry, bytes_read)) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Err(PageStoreError::ChecksumMismatch { .. }) => {
                    warn!(
                        "Checksum mismatch at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(PageStoreError::InvalidFormat(msg))
                    if msg == "Entry too short" || msg == "Incomplete entry" =>
                {
                    // torn write at the tail
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalConfig, WalWriter};
    use crate::{Delta, Key};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_wal_recovery_after_lsn() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path().to_path_buf());

        {
            let writer = WalWriter::new(config.clone(), Lsn(1)).unwrap();
            for lsn in 1..=10u64 {
                let deltas = vec![Delta::put(Key::new(0, 1, lsn as u32), vec![1u8; 8])];
                writer.append(&WalEntry::ingest(Lsn(lsn), &deltas).unwrap()).unwrap();
                if lsn == 4 {
                    writer.rotate(Lsn(5)).unwrap();
                }
            }
            writer.sync().unwrap();
        }

        let reader = WalReader::new(config.dir.clone());
        assert_eq!(reader.recover_after(Lsn::INVALID).unwrap().len(), 10);

        let entries = reader.recover_after(Lsn(6)).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].lsn, Lsn(7));
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path().to_path_buf());
        {
            let writer = WalWriter::new(config.clone(), Lsn(1)).unwrap();
            for lsn in 1..=3u64 {
                let deltas = vec![Delta::Delete { key: Key::new(0, 0, lsn as u32) }];
                writer.append(&WalEntry::ingest(Lsn(lsn), &deltas).unwrap()).unwrap();
            }
        }
        let path = temp_dir.path().join(crate::wal::segment_file_name(Lsn(1)));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();

        let entries = WalReader::new(config.dir).recover_after(Lsn::INVALID).unwrap();
        assert_eq!(entries.len(), 3);
    }
}
