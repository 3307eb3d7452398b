//! Layer file reader with integrity checks

use super::builder::{FOOTER_SIZE, HEADER_SIZE, TAG_PUT, TAG_TOMBSTONE};
use super::{LayerKind, LayerName, FORMAT_VERSION, LAYER_MAGIC};
use crate::{Key, Lsn, PageStoreError, Record, Result, Value};
use bytes::{Buf, Bytes};
use std::path::Path;

/// Read a layer file, validate it against its name, and decode the records
pub fn read_layer_file(path: &Path, expected: &LayerName) -> Result<Vec<Record>> {
    let data = std::fs::read(path)?;
    decode(&data, expected).map_err(|e| match e {
        PageStoreError::CorruptLayer { .. } | PageStoreError::Io(_) => e,
        other => PageStoreError::corrupt(path, other.to_string()),
    })
}

fn decode(data: &[u8], expected: &LayerName) -> Result<Vec<Record>> {
    if data.len() < HEADER_SIZE + 4 + FOOTER_SIZE {
        return Err(PageStoreError::InvalidFormat("Layer file too short".into()));
    }

    let (content, footer) = data.split_at(data.len() - FOOTER_SIZE);
    let mut cursor = std::io::Cursor::new(footer);
    let expected_checksum = cursor.get_u32_le();
    if &footer[4..8] != LAYER_MAGIC {
        return Err(PageStoreError::InvalidFormat("Invalid layer footer magic".into()));
    }
    let actual_checksum = crc32fast::hash(content);
    if expected_checksum != actual_checksum {
        return Err(PageStoreError::ChecksumMismatch {
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    let mut cursor = std::io::Cursor::new(content);
    let mut magic = [0u8; 4];
    cursor.copy_to_slice(&mut magic);
    if &magic != LAYER_MAGIC {
        return Err(PageStoreError::InvalidFormat("Invalid layer header magic".into()));
    }
    let version = cursor.get_u32_le();
    if version != FORMAT_VERSION {
        return Err(PageStoreError::InvalidFormat(format!(
            "Unsupported layer version: {}",
            version
        )));
    }
    let kind = LayerKind::try_from(cursor.get_u8())?;
    let key_start = read_key(&mut cursor)?;
    let key_end = read_key(&mut cursor)?;
    let lsn_start = Lsn(cursor.get_u64_le());
    let lsn_end = Lsn(cursor.get_u64_le());
    let count = cursor.get_u32_le() as usize;

    let header = LayerName {
        kind,
        key_range: key_start..key_end,
        lsn_range: lsn_start..lsn_end,
    };
    if &header != expected {
        return Err(PageStoreError::InvalidFormat(format!(
            "Layer header {} does not match file name {}",
            header, expected
        )));
    }

    let body_len = cursor.get_u32_le() as usize;
    let pos = cursor.position() as usize;
    if pos + body_len != content.len() {
        return Err(PageStoreError::InvalidFormat("Layer body length mismatch".into()));
    }
    let body = lz4_flex::decompress_size_prepended(&content[pos..])
        .map_err(|e| PageStoreError::InvalidFormat(format!("lz4: {}", e)))?;

    let body = Bytes::from(body);
    let mut cursor = std::io::Cursor::new(&body[..]);
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_key(&mut cursor)?;
        if cursor.remaining() < 9 {
            return Err(PageStoreError::InvalidFormat("Truncated record".into()));
        }
        let lsn = Lsn(cursor.get_u64_le());
        let value = match cursor.get_u8() {
            TAG_PUT => {
                if cursor.remaining() < 4 {
                    return Err(PageStoreError::InvalidFormat("Truncated record".into()));
                }
                let len = cursor.get_u32_le() as usize;
                let start = cursor.position() as usize;
                if cursor.remaining() < len {
                    return Err(PageStoreError::InvalidFormat("Truncated value".into()));
                }
                cursor.advance(len);
                Value::Put(body.slice(start..start + len))
            }
            TAG_TOMBSTONE => Value::Tombstone,
            tag => {
                return Err(PageStoreError::InvalidFormat(format!(
                    "Invalid value tag: {}",
                    tag
                )))
            }
        };
        records.push(Record::new(key, lsn, value));
    }
    if cursor.has_remaining() {
        return Err(PageStoreError::InvalidFormat("Trailing bytes in layer body".into()));
    }

    Ok(records)
}

fn read_key(cursor: &mut std::io::Cursor<&[u8]>) -> Result<Key> {
    if cursor.remaining() < Key::SIZE {
        return Err(PageStoreError::InvalidFormat("Truncated key".into()));
    }
    let mut buf = [0u8; Key::SIZE];
    cursor.copy_to_slice(&mut buf);
    Key::from_bytes(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Layer, LayerWriter};
    use tempfile::TempDir;

    fn sample_records() -> Vec<Record> {
        let mut records = Vec::new();
        for block in 0..50u32 {
            let key = Key::new(1, 10, block);
            records.push(Record::new(
                key,
                Lsn(100 + block as u64),
                Value::Put(Bytes::from(format!("value-{}", block))),
            ));
            if block % 10 == 0 {
                records.push(Record::new(key, Lsn(500 + block as u64), Value::Tombstone));
            }
        }
        records
    }

    #[test]
    fn test_write_and_read_delta_layer() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer =
            LayerWriter::new_delta(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(100)..Lsn(600));
        let records = sample_records();
        for record in &records {
            writer.add(record).unwrap();
        }
        let layer = writer.finish().unwrap();

        assert_eq!(layer.file_size(), std::fs::metadata(layer.path()).unwrap().len());
        assert_eq!(layer.load().unwrap(), records);

        let reopened = crate::layer::PersistentLayer::open(layer.path().to_path_buf()).unwrap();
        assert_eq!(reopened.name(), layer.name());
        reopened.verify().unwrap();

        let mut out = Vec::new();
        reopened
            .collect_records(&(Key::new(1, 10, 0)..Key::new(1, 10, 5)), Lsn(300), &mut out)
            .unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer =
            LayerWriter::new_delta(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(1)..Lsn(10));
        let key = Key::new(1, 1, 1);
        writer.add(&Record::new(key, Lsn(5), Value::Tombstone)).unwrap();
        assert!(writer.add(&Record::new(key, Lsn(4), Value::Tombstone)).is_err());
        assert!(writer.add(&Record::new(key, Lsn(20), Value::Tombstone)).is_err());
    }

    #[test]
    fn test_corruption_detected() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer =
            LayerWriter::new_delta(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(100)..Lsn(600));
        for record in &sample_records() {
            writer.add(record).unwrap();
        }
        let layer = writer.finish().unwrap();

        let mut data = std::fs::read(layer.path()).unwrap();
        data[HEADER_SIZE + 10] ^= 0xFF;
        std::fs::write(layer.path(), &data).unwrap();

        let err = layer.load().unwrap_err();
        assert!(err.is_corruption(), "unexpected error: {}", err);
    }

    #[test]
    fn test_empty_image_layer() {
        let temp_dir = TempDir::new().unwrap();
        let writer = LayerWriter::new_image(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(42));
        let layer = writer.finish().unwrap();
        assert!(layer.is_image());
        assert!(layer.load().unwrap().is_empty());
    }
}
