//! Write-Ahead Log (WAL) implementation
//!
//! Every ingested batch is appended to the timeline's WAL before it reaches
//! the open in-memory layer. After a crash the WAL is replayed on top of
//! the last checkpoint. Segments are named after the first LSN they may
//! contain, so a segment can be dropped as soon as the next segment starts
//! at or below the first LSN that is not yet on disk.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryType};
pub use reader::WalReader;
pub use writer::WalWriter;

use crate::{Lsn, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl WalConfig {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

pub(crate) fn segment_file_name(start_lsn: Lsn) -> String {
    format!("wal_{:016X}.log", start_lsn.0)
}

fn parse_segment_name(name: &str) -> Option<Lsn> {
    let hex = name.strip_prefix("wal_")?.strip_suffix(".log")?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok().map(Lsn)
}

/// WAL segments in `dir`, ordered by start LSN
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(Lsn, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(start) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_name)
        {
            segments.push((start, path));
        }
    }
    segments.sort_by_key(|(start, _)| *start);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        let name = segment_file_name(Lsn(0x2A));
        assert_eq!(name, "wal_000000000000002A.log");
        assert_eq!(parse_segment_name(&name), Some(Lsn(0x2A)));
        assert_eq!(parse_segment_name("wal_42.log"), None);
        assert_eq!(parse_segment_name("metadata"), None);
    }

    #[test]
    fn test_sync_policy_config() {
        let policy: SyncPolicy = serde_json::from_str("\"immediate\"").unwrap();
        assert_eq!(policy, SyncPolicy::Immediate);
        let policy: SyncPolicy = serde_json::from_str(r#"{"every_n": 16}"#).unwrap();
        assert_eq!(policy, SyncPolicy::EveryN(16));
    }
}
