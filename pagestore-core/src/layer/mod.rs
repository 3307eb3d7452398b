//! Persistent layers
//!
//! Immutable on-disk storage for versioned key/value records:
//! - Delta layers hold every record of a key range within an LSN range
//! - Image layers hold the materialized state of a key range at one LSN
//! - Files are checksummed; a failed check is reported as a corrupt layer
//!
//! A layer removed from the layer map is unlinked only when its last
//! reference goes away, so snapshots taken before the removal stay readable.

mod builder;
mod layer_map;
mod reader;

pub use builder::LayerWriter;
pub use layer_map::{reconstruct, LayerMap, LayerSnapshot, Reconstructed};
pub use reader::read_layer_file;

use crate::{Key, Lsn, PageStoreError, Record, Result};
use regex::Regex;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Layer file format version
pub const FORMAT_VERSION: u32 = 1;

/// Magic bytes at both ends of a layer file
pub const LAYER_MAGIC: &[u8; 4] = b"PSLY";

/// Kind of layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum LayerKind {
    Delta = 1,
    Image = 2,
}

impl TryFrom<u8> for LayerKind {
    type Error = PageStoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LayerKind::Delta),
            2 => Ok(LayerKind::Image),
            _ => Err(PageStoreError::InvalidFormat(format!(
                "Invalid layer kind: {}",
                value
            ))),
        }
    }
}

/// Common view over in-memory and persistent layers
pub trait Layer: Send + Sync {
    fn kind(&self) -> LayerKind;

    fn key_range(&self) -> Range<Key>;

    /// LSN range, end exclusive
    fn lsn_range(&self) -> Range<Lsn>;

    /// Append records with a key in `keys` and LSN at or below `lsn`
    fn collect_records(&self, keys: &Range<Key>, lsn: Lsn, out: &mut Vec<Record>) -> Result<()>;

    /// Short human readable name for logs
    fn describe(&self) -> String;

    fn is_image(&self) -> bool {
        self.kind() == LayerKind::Image
    }
}

/// Identity of a persistent layer, encoded in its file name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerName {
    pub kind: LayerKind,
    pub key_range: Range<Key>,
    pub lsn_range: Range<Lsn>,
}

impl LayerName {
    pub fn delta(key_range: Range<Key>, lsn_range: Range<Lsn>) -> Self {
        Self {
            kind: LayerKind::Delta,
            key_range,
            lsn_range,
        }
    }

    /// Image at `lsn`; its LSN range is `lsn..lsn+1`
    pub fn image(key_range: Range<Key>, lsn: Lsn) -> Self {
        Self {
            kind: LayerKind::Image,
            key_range,
            lsn_range: lsn..lsn.next(),
        }
    }

    /// Whether the layer spans the whole key space
    pub fn is_full_key_range(&self) -> bool {
        self.key_range.start == Key::MIN && self.key_range.end == Key::MAX
    }

    fn regex() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"^([0-9A-F]{24})-([0-9A-F]{24})__([0-9A-F]{16})(?:-([0-9A-F]{16}))?$")
                .expect("layer name pattern is valid")
        })
    }

    /// Parse a file name; returns None for files that are not layers
    pub fn parse(name: &str) -> Option<Self> {
        let caps = Self::regex().captures(name)?;
        let key_start = Key::from_hex(&caps[1]).ok()?;
        let key_end = Key::from_hex(&caps[2]).ok()?;
        let lsn_start = Lsn(u64::from_str_radix(&caps[3], 16).ok()?);
        let parsed = match caps.get(4) {
            Some(end) => {
                let lsn_end = Lsn(u64::from_str_radix(end.as_str(), 16).ok()?);
                LayerName::delta(key_start..key_end, lsn_start..lsn_end)
            }
            None => LayerName::image(key_start..key_end, lsn_start),
        };
        if parsed.key_range.start >= parsed.key_range.end
            || parsed.lsn_range.start >= parsed.lsn_range.end
        {
            return None;
        }
        Some(parsed)
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LayerKind::Delta => write!(
                f,
                "{}-{}__{:016X}-{:016X}",
                self.key_range.start.to_hex(),
                self.key_range.end.to_hex(),
                self.lsn_range.start.0,
                self.lsn_range.end.0
            ),
            LayerKind::Image => write!(
                f,
                "{}-{}__{:016X}",
                self.key_range.start.to_hex(),
                self.key_range.end.to_hex(),
                self.lsn_range.start.0
            ),
        }
    }
}

impl FromStr for LayerName {
    type Err = PageStoreError;

    fn from_str(s: &str) -> Result<Self> {
        LayerName::parse(s)
            .ok_or_else(|| PageStoreError::InvalidFormat(format!("Not a layer file name: {}", s)))
    }
}

/// An immutable layer file in a timeline directory
pub struct PersistentLayer {
    name: LayerName,
    file_name: String,
    path: PathBuf,
    file_size: u64,
    deleted: AtomicBool,
}

impl PersistentLayer {
    /// Open an existing layer file; the name must parse as a layer name
    pub fn open(path: PathBuf) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PageStoreError::InvalidFormat(format!("Bad layer path {:?}", path)))?
            .to_string();
        let name: LayerName = file_name.parse()?;
        let file_size = std::fs::metadata(&path)?.len();
        Ok(Self {
            name,
            file_name,
            path,
            file_size,
            deleted: AtomicBool::new(false),
        })
    }

    pub(crate) fn from_written(name: LayerName, path: PathBuf, file_size: u64) -> Self {
        Self {
            file_name: name.to_string(),
            name,
            path,
            file_size,
            deleted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &LayerName {
        &self.name
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read and decode all records, validating the checksum
    pub fn load(&self) -> Result<Vec<Record>> {
        read_layer_file(&self.path, &self.name)
    }

    /// Full integrity check
    pub fn verify(&self) -> Result<()> {
        self.load().map(|_| ())
    }

    /// Read the raw file bytes (for upload)
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.path)?)
    }

    /// Schedule the file for removal once the last reference is dropped
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl Layer for PersistentLayer {
    fn kind(&self) -> LayerKind {
        self.name.kind
    }

    fn key_range(&self) -> Range<Key> {
        self.name.key_range.clone()
    }

    fn lsn_range(&self) -> Range<Lsn> {
        self.name.lsn_range.clone()
    }

    fn collect_records(&self, keys: &Range<Key>, lsn: Lsn, out: &mut Vec<Record>) -> Result<()> {
        if keys.end <= self.name.key_range.start
            || keys.start >= self.name.key_range.end
            || lsn < self.name.lsn_range.start
        {
            return Ok(());
        }
        out.extend(
            self.load()?
                .into_iter()
                .filter(|r| keys.contains(&r.key) && r.lsn <= lsn),
        );
        Ok(())
    }

    fn describe(&self) -> String {
        self.file_name.clone()
    }
}

impl Drop for PersistentLayer {
    fn drop(&mut self) {
        if !self.is_deleted() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed layer file {}", self.file_name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove layer file {:?}: {}", self.path, e),
        }
    }
}

impl fmt::Debug for PersistentLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentLayer")
            .field("name", &self.file_name)
            .field("file_size", &self.file_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_name_roundtrip() {
        let delta = LayerName::delta(Key::MIN..Key::MAX, Lsn(0x10)..Lsn(0x2000));
        let s = delta.to_string();
        assert_eq!(
            s,
            "000000000000000000000000-FFFFFFFFFFFFFFFFFFFFFFFF__0000000000000010-0000000000002000"
        );
        assert_eq!(LayerName::parse(&s), Some(delta.clone()));
        assert!(delta.is_full_key_range());

        let image = LayerName::image(Key::new(1, 0, 0)..Key::new(2, 0, 0), Lsn(0x30));
        let parsed = LayerName::parse(&image.to_string()).unwrap();
        assert_eq!(parsed.kind, LayerKind::Image);
        assert_eq!(parsed.lsn_range, Lsn(0x30)..Lsn(0x31));
        assert!(!parsed.is_full_key_range());
    }

    #[test]
    fn test_non_layer_names_rejected() {
        assert!(LayerName::parse("metadata").is_none());
        assert!(LayerName::parse("wal").is_none());
        let delta = LayerName::delta(Key::MIN..Key::MAX, Lsn(1)..Lsn(2)).to_string();
        assert!(LayerName::parse(&format!("{}.___temp", delta)).is_none());
        // empty LSN range
        let bad = format!("{}-{}__{:016X}-{:016X}", Key::MIN, Key::MAX, 5, 5);
        assert!(LayerName::parse(&bad).is_none());
    }
}
