//! In-memory layer
//!
//! The open layer buffers recent WAL-derived records in a concurrent skip
//! list keyed by (key, lsn). When the accumulated volume crosses the
//! checkpoint distance it is frozen and flushed into an on-disk delta layer.

use crate::layer::{Layer, LayerKind};
use crate::{Key, Lsn, Record, Result, Value};
use crossbeam_skiplist::SkipMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Sentinel for "not frozen yet"
const OPEN: u64 = u64::MAX;

/// In-memory layer for the newest records of a timeline
pub struct InMemoryLayer {
    start_lsn: Lsn,
    /// Exclusive end LSN, set once on freeze
    end_lsn: AtomicU64,
    records: SkipMap<(Key, Lsn), Value>,
    /// Accumulated record volume in bytes
    size_bytes: AtomicUsize,
    created_at: Instant,
}

impl InMemoryLayer {
    /// Create an open layer whose first record is at or after `start_lsn`
    pub fn new(start_lsn: Lsn) -> Self {
        Self {
            start_lsn,
            end_lsn: AtomicU64::new(OPEN),
            records: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Insert one record. Only the single ingest writer calls this.
    pub fn put(&self, record: Record) {
        debug_assert!(!self.is_frozen(), "put into frozen layer");
        let size = record.size();
        self.records.insert((record.key, record.lsn), record.value);
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Insert multiple records
    pub fn put_batch(&self, records: Vec<Record>) {
        for record in records {
            self.put(record);
        }
    }

    /// Freeze the layer; nothing may be added afterwards
    pub fn freeze(&self, end_lsn: Lsn) {
        debug_assert!(end_lsn > self.start_lsn);
        self.end_lsn.store(end_lsn.0, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.end_lsn.load(Ordering::Acquire) != OPEN
    }

    /// Exclusive end LSN, if frozen
    pub fn end_lsn(&self) -> Option<Lsn> {
        match self.end_lsn.load(Ordering::Acquire) {
            OPEN => None,
            end => Some(Lsn(end)),
        }
    }

    /// Accumulated size in bytes
    pub fn size(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Get the age since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in (key, lsn) order
    pub fn iter(&self) -> Vec<Record> {
        self.records
            .iter()
            .map(|e| {
                let (key, lsn) = *e.key();
                Record::new(key, lsn, e.value().clone())
            })
            .collect()
    }
}

impl Layer for InMemoryLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Delta
    }

    fn key_range(&self) -> Range<Key> {
        Key::MIN..Key::MAX
    }

    fn lsn_range(&self) -> Range<Lsn> {
        self.start_lsn..self.end_lsn().unwrap_or(Lsn::MAX)
    }

    fn collect_records(&self, keys: &Range<Key>, lsn: Lsn, out: &mut Vec<Record>) -> Result<()> {
        if keys.start >= keys.end {
            return Ok(());
        }
        for entry in self
            .records
            .range((keys.start, Lsn::INVALID)..(keys.end, Lsn::INVALID))
        {
            let (key, rec_lsn) = *entry.key();
            if rec_lsn <= lsn {
                out.push(Record::new(key, rec_lsn, entry.value().clone()));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self.end_lsn() {
            Some(end) => format!("inmem-{}-{}", self.start_lsn, end),
            None => format!("inmem-{}-open", self.start_lsn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn put(key: Key, lsn: u64, value: &'static str) -> Record {
        Record::new(key, Lsn(lsn), Value::Put(Bytes::from_static(value.as_bytes())))
    }

    #[test]
    fn test_memtable_insert_query() {
        let layer = InMemoryLayer::new(Lsn(10));
        let key = Key::new(1, 1, 0);
        for i in 0..100u64 {
            layer.put(put(Key::new(1, 1, i as u32), 10 + i, "payload"));
        }
        layer.put(put(key, 200, "newer"));

        assert_eq!(layer.len(), 101);
        assert!(layer.size() > 0);

        let mut out = Vec::new();
        layer.collect_records(&(key..key.next()), Lsn(150), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].lsn, Lsn(10));
        assert_eq!(out[0].value, Value::Put(Bytes::from_static(b"payload")));

        out.clear();
        layer.collect_records(&(key..key.next()), Lsn(300), &mut out).unwrap();
        assert_eq!(out.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![Lsn(10), Lsn(200)]);

        out.clear();
        layer
            .collect_records(&(Key::new(1, 1, 50)..Key::new(1, 1, 60)), Lsn(1000), &mut out)
            .unwrap();
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_freeze_sets_lsn_range() {
        let layer = InMemoryLayer::new(Lsn(1));
        assert!(!layer.is_frozen());
        assert_eq!(layer.lsn_range(), Lsn(1)..Lsn::MAX);

        layer.put(put(Key::new(0, 0, 1), 5, "x"));
        layer.freeze(Lsn(6));
        assert!(layer.is_frozen());
        assert_eq!(layer.lsn_range(), Lsn(1)..Lsn(6));
    }
}
