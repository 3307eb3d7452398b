//! Layer writer for persisting sorted records to disk

use super::{LayerKind, LayerName, PersistentLayer, FORMAT_VERSION, LAYER_MAGIC};
use crate::crashsafe;
use crate::{Key, Lsn, PageStoreError, Record, Result, Value};
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::PathBuf;

/// Header size in bytes
pub(super) const HEADER_SIZE: usize = 4 + 4 + 1 + Key::SIZE * 2 + 8 + 8 + 4;

/// Footer size in bytes: checksum + magic
pub(super) const FOOTER_SIZE: usize = 8;

pub(super) const TAG_TOMBSTONE: u8 = 0;
pub(super) const TAG_PUT: u8 = 1;

/// Builds one delta or image layer file
///
/// File layout:
/// - header: magic, version, kind, key range, LSN range, record count
/// - 4 bytes body length, then the lz4-compressed record stream
/// - footer: CRC32 over everything before it, magic
pub struct LayerWriter {
    dir: PathBuf,
    name: LayerName,
    body: BytesMut,
    count: u32,
    last: Option<(Key, Lsn)>,
}

impl LayerWriter {
    /// Start a delta layer for `key_range` x `lsn_range`
    pub fn new_delta(dir: PathBuf, key_range: Range<Key>, lsn_range: Range<Lsn>) -> Self {
        Self::new(dir, LayerName::delta(key_range, lsn_range))
    }

    /// Start an image layer for `key_range` at `lsn`
    pub fn new_image(dir: PathBuf, key_range: Range<Key>, lsn: Lsn) -> Self {
        Self::new(dir, LayerName::image(key_range, lsn))
    }

    fn new(dir: PathBuf, name: LayerName) -> Self {
        Self {
            dir,
            name,
            body: BytesMut::new(),
            count: 0,
            last: None,
        }
    }

    pub fn name(&self) -> &LayerName {
        &self.name
    }

    /// Number of records added so far
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add a record; records must arrive in (key, lsn) order
    pub fn add(&mut self, record: &Record) -> Result<()> {
        if !self.name.key_range.contains(&record.key) || !self.name.lsn_range.contains(&record.lsn) {
            return Err(PageStoreError::Internal(format!(
                "Record {}@{} outside layer {}",
                record.key, record.lsn, self.name
            )));
        }
        if self.name.kind == LayerKind::Image && record.value == Value::Tombstone {
            return Err(PageStoreError::Internal(
                "Image layers hold live values only".into(),
            ));
        }
        let pos = (record.key, record.lsn);
        if let Some(last) = self.last {
            if pos <= last {
                return Err(PageStoreError::Internal(format!(
                    "Records out of order in layer {}: {}@{} after {}@{}",
                    self.name, pos.0, pos.1, last.0, last.1
                )));
            }
        }
        self.last = Some(pos);

        self.body.put_slice(&record.key.to_bytes());
        self.body.put_u64_le(record.lsn.0);
        match &record.value {
            Value::Put(bytes) => {
                self.body.put_u8(TAG_PUT);
                self.body.put_u32_le(bytes.len() as u32);
                self.body.put_slice(bytes);
            }
            Value::Tombstone => self.body.put_u8(TAG_TOMBSTONE),
        }
        self.count += 1;
        Ok(())
    }

    /// Write the file durably and return the opened layer
    pub fn finish(self) -> Result<PersistentLayer> {
        let path = self.dir.join(self.name.to_string());
        let tmp = crashsafe::temp_path(&path);

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len() / 2 + FOOTER_SIZE);
        buf.put_slice(LAYER_MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u8(self.name.kind as u8);
        buf.put_slice(&self.name.key_range.start.to_bytes());
        buf.put_slice(&self.name.key_range.end.to_bytes());
        buf.put_u64_le(self.name.lsn_range.start.0);
        buf.put_u64_le(self.name.lsn_range.end.0);
        buf.put_u32_le(self.count);

        let compressed = lz4_flex::compress_prepend_size(&self.body);
        buf.put_u32_le(compressed.len() as u32);
        buf.put_slice(&compressed);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.put_slice(LAYER_MAGIC);

        {
            let mut file = BufWriter::new(File::create(&tmp)?);
            file.write_all(&buf)?;
            file.flush()?;
            file.get_ref().sync_all()?;
        }
        crashsafe::durable_rename(&tmp, &path)?;

        Ok(PersistentLayer::from_written(self.name, path, buf.len() as u64))
    }
}
