//! Core types for Pagestore

use bytes::Bytes;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use uuid::Uuid;

/// Log sequence number: a position in the WAL stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The zero LSN, before any record
    pub const INVALID: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// The next LSN
    pub fn next(self) -> Lsn {
        Lsn(self.0.saturating_add(1))
    }

    /// The previous LSN, saturating at zero
    pub fn prev(self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }

    pub fn is_valid(self) -> bool {
        self != Lsn::INVALID
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl FromStr for Lsn {
    type Err = crate::PageStoreError;

    fn from_str(s: &str) -> crate::Result<Self> {
        let invalid = || crate::PageStoreError::InvalidFormat(format!("Invalid LSN: {}", s));
        let (hi, lo) = s.split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct LsnVisitor;

        impl<'de> Visitor<'de> for LsnVisitor {
            type Value = Lsn;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an LSN as \"X/Y\" or an integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Lsn, E> {
                Ok(Lsn(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Lsn, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(LsnVisitor)
    }
}

/// Storage key: one block of one relation of one database
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub database: u32,
    pub relation: u32,
    pub block: u32,
}

impl Key {
    /// Encoded size in bytes
    pub const SIZE: usize = 12;

    pub const MIN: Key = Key {
        database: 0,
        relation: 0,
        block: 0,
    };

    /// Exclusive upper bound of the key space, never stored
    pub const MAX: Key = Key {
        database: u32::MAX,
        relation: u32::MAX,
        block: u32::MAX,
    };

    pub fn new(database: u32, relation: u32, block: u32) -> Self {
        Self {
            database,
            relation,
            block,
        }
    }

    /// Big-endian encoding; byte order matches key order
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.database.to_be_bytes());
        buf[4..8].copy_from_slice(&self.relation.to_be_bytes());
        buf[8..12].copy_from_slice(&self.block.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> crate::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(crate::PageStoreError::InvalidFormat("Key too short".into()));
        }
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self::new(word(0), word(4), word(8)))
    }

    /// The smallest key strictly greater than this one
    pub fn next(&self) -> Key {
        let (block, carry) = self.block.overflowing_add(1);
        if !carry {
            return Key { block, ..*self };
        }
        let (relation, carry) = self.relation.overflowing_add(1);
        if !carry {
            return Key::new(self.database, relation, 0);
        }
        Key::new(self.database.saturating_add(1), 0, 0)
    }

    /// Key range holding every block of a relation
    pub fn relation_range(database: u32, relation: u32) -> Range<Key> {
        Key::new(database, relation, 0)..Key::new(database, relation, 0).next_relation()
    }

    /// Key range holding every relation of a database
    pub fn database_range(database: u32) -> Range<Key> {
        let end = match database.checked_add(1) {
            Some(next) => Key::new(next, 0, 0),
            None => Key::MAX,
        };
        Key::new(database, 0, 0)..end
    }

    fn next_relation(&self) -> Key {
        match self.relation.checked_add(1) {
            Some(relation) => Key::new(self.database, relation, 0),
            None => Key::database_range(self.database).end,
        }
    }

    /// 24 hex digits, used in layer file names
    pub fn to_hex(&self) -> String {
        format!("{:08X}{:08X}{:08X}", self.database, self.relation, self.block)
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let invalid = || crate::PageStoreError::InvalidFormat(format!("Invalid key: {}", s));
        if s.len() != 24 {
            return Err(invalid());
        }
        let part = |r: Range<usize>| u32::from_str_radix(&s[r], 16).map_err(|_| invalid());
        Ok(Self::new(part(0..8)?, part(8..16)?, part(16..24)?))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

macro_rules! id_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = crate::PageStoreError;

            fn from_str(s: &str) -> crate::Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    crate::PageStoreError::InvalidFormat(format!("Invalid id {}: {}", s, e))
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

id_type!(TenantId, "Tenant identifier: the isolation unit owning timelines");
id_type!(TimelineId, "Timeline identifier: one branch of WAL-derived history");

/// A WAL-derived change, opaque apart from its key and payload size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    /// Insert or overwrite a key
    Put { key: Key, value: Bytes },
    /// Remove a key
    Delete { key: Key },
    /// Remove every block of a relation
    DropRelation { database: u32, relation: u32 },
    /// Remove every relation of a database
    DropDatabase { database: u32 },
}

impl Delta {
    pub fn put(key: Key, value: impl Into<Bytes>) -> Self {
        Delta::Put {
            key,
            value: value.into(),
        }
    }

    /// Key written by a `Put` or `Delete`
    pub fn key(&self) -> Option<Key> {
        match self {
            Delta::Put { key, .. } | Delta::Delete { key } => Some(*key),
            Delta::DropRelation { .. } | Delta::DropDatabase { .. } => None,
        }
    }
}

/// Value stored in a layer for a key at an LSN
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Put(Bytes),
    Tombstone,
}

impl Value {
    /// Logical bytes this value contributes while live
    pub fn logical_size(&self) -> u64 {
        match self {
            Value::Put(bytes) => bytes.len() as u64,
            Value::Tombstone => 0,
        }
    }

    /// Approximate in-memory footprint
    pub fn size(&self) -> usize {
        match self {
            Value::Put(bytes) => bytes.len() + 1,
            Value::Tombstone => 1,
        }
    }
}

/// One versioned entry: key, LSN and value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Key,
    pub lsn: Lsn,
    pub value: Value,
}

impl Record {
    pub fn new(key: Key, lsn: Lsn, value: Value) -> Self {
        Self { key, lsn, value }
    }

    /// Approximate size in bytes (key + lsn + value)
    pub fn size(&self) -> usize {
        Key::SIZE + 8 + self.value.size()
    }
}

/// Serde helpers for durations written as "10m", "1s", "250ms" or integer seconds
pub mod duration_format {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() != 0 {
            serializer.collect_str(&format_args!("{}ms", d.as_millis()))
        } else {
            serializer.collect_str(&format_args!("{}s", d.as_secs()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a duration such as \"10m\", \"1s\", \"250ms\" or seconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse(v).ok_or_else(|| E::custom(format!("invalid duration: {}", v)))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }

    /// Parse "<n><unit>" where unit is ms, s, m, h or d
    pub fn parse(s: &str) -> Option<Duration> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        let n: u64 = num.parse().ok()?;
        let secs = match unit.trim() {
            "ms" => return Some(Duration::from_millis(n)),
            "" | "s" => n,
            "m" => n * 60,
            "h" => n * 3600,
            "d" => n * 86400,
            _ => return None,
        };
        Some(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lsn_format() {
        let lsn = Lsn(0x1_0169_AC58);
        assert_eq!(lsn.to_string(), "1/169AC58");
        assert_eq!("1/169AC58".parse::<Lsn>().unwrap(), lsn);
        assert!("garbage".parse::<Lsn>().is_err());

        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"1/169AC58\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }

    #[test]
    fn test_key_order_matches_bytes() {
        let a = Key::new(1, 2, 3);
        let b = Key::new(1, 3, 0);
        let c = Key::new(2, 0, 0);
        assert!(a < b && b < c);
        assert!(a.to_bytes() < b.to_bytes() && b.to_bytes() < c.to_bytes());
        assert_eq!(Key::from_bytes(&a.to_bytes()).unwrap(), a);
        assert_eq!(Key::from_hex(&a.to_hex()).unwrap(), a);
    }

    #[test]
    fn test_key_ranges() {
        let rel = Key::relation_range(5, 7);
        assert!(rel.contains(&Key::new(5, 7, 0)));
        assert!(rel.contains(&Key::new(5, 7, u32::MAX)));
        assert!(!rel.contains(&Key::new(5, 8, 0)));

        let db = Key::database_range(5);
        assert!(db.contains(&Key::new(5, u32::MAX, 10)));
        assert!(!db.contains(&Key::new(6, 0, 0)));

        assert_eq!(Key::new(1, 1, u32::MAX).next(), Key::new(1, 2, 0));
    }

    #[test]
    fn test_ids_roundtrip_as_hex() {
        let id = TenantId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<TenantId>().unwrap(), id);
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(duration_format::parse("10m"), Some(Duration::from_secs(600)));
        assert_eq!(duration_format::parse("1s"), Some(Duration::from_secs(1)));
        assert_eq!(duration_format::parse("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(duration_format::parse("42"), Some(Duration::from_secs(42)));
        assert_eq!(duration_format::parse("1y"), None);
    }
}
