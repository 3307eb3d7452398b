//! WAL entry types and serialization

use crate::{Delta, Lsn, PageStoreError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryType {
    /// A batch of deltas sharing one LSN
    Ingest = 1,
}

impl TryFrom<u8> for WalEntryType {
    type Error = PageStoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryType::Ingest),
            _ => Err(PageStoreError::InvalidFormat(format!(
                "Invalid WAL entry type: {}",
                value
            ))),
        }
    }
}

/// A single WAL entry
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Entry type
    pub entry_type: WalEntryType,
    /// LSN of the batch
    pub lsn: Lsn,
    /// Entry payload (bincode encoded deltas)
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Create an ingest entry for a batch of deltas
    pub fn ingest(lsn: Lsn, deltas: &[Delta]) -> Result<Self> {
        let payload =
            bincode::serialize(deltas).map_err(|e| PageStoreError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            entry_type: WalEntryType::Ingest,
            lsn,
            payload,
        })
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry type
    /// - 8 bytes: LSN
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 1 + 8 + 4 + self.payload.len() + 4);

        buf.put_u32_le(0);
        buf.put_u8(self.entry_type as u8);
        buf.put_u64_le(self.lsn.0);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        // checksum excludes the length prefix
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize entry from bytes, validating checksum
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(PageStoreError::InvalidFormat("Entry too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let len = cursor.get_u32_le() as usize;
        if len < 1 + 8 + 4 + 4 || data.len() < 4 + len {
            return Err(PageStoreError::InvalidFormat("Incomplete entry".into()));
        }

        let entry_data = &data[4..4 + len];

        let expected_checksum = {
            let mut c = std::io::Cursor::new(&entry_data[entry_data.len() - 4..]);
            c.get_u32_le()
        };
        let actual_checksum = crc32fast::hash(&entry_data[..entry_data.len() - 4]);
        if expected_checksum != actual_checksum {
            return Err(PageStoreError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let mut cursor = std::io::Cursor::new(entry_data);
        let entry_type = WalEntryType::try_from(cursor.get_u8())?;
        let lsn = Lsn(cursor.get_u64_le());
        let payload_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if pos + payload_len + 4 != entry_data.len() {
            return Err(PageStoreError::InvalidFormat("Payload length mismatch".into()));
        }
        let payload = entry_data[pos..pos + payload_len].to_vec();

        Ok((
            WalEntry {
                entry_type,
                lsn,
                payload,
            },
            4 + len,
        ))
    }

    /// Decode the deltas of an ingest entry
    pub fn deltas(&self) -> Result<Vec<Delta>> {
        bincode::deserialize(&self.payload).map_err(|e| PageStoreError::InvalidFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Key;

    #[test]
    fn test_entry_serialization() {
        let deltas = vec![
            Delta::put(Key::new(1, 2, 3), vec![7u8; 100]),
            Delta::Delete { key: Key::new(1, 2, 4) },
            Delta::DropDatabase { database: 9 },
        ];

        let entry = WalEntry::ingest(Lsn(42), &deltas).unwrap();
        let serialized = entry.serialize_with_checksum();

        let (deserialized, len) = WalEntry::deserialize_with_checksum(&serialized).unwrap();
        assert_eq!(len, serialized.len());
        assert_eq!(deserialized.entry_type, WalEntryType::Ingest);
        assert_eq!(deserialized.lsn, Lsn(42));
        assert_eq!(deserialized.deltas().unwrap(), deltas);
    }

    #[test]
    fn test_checksum_validation() {
        let entry = WalEntry::ingest(Lsn(1), &[Delta::Delete { key: Key::MIN }]).unwrap();
        let mut serialized = entry.serialize_with_checksum().to_vec();

        serialized[10] ^= 0xFF;

        let result = WalEntry::deserialize_with_checksum(&serialized);
        assert!(matches!(result, Err(PageStoreError::ChecksumMismatch { .. })));
    }
}
