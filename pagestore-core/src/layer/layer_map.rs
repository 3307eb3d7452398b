//! Layer map: the set of layers that make up one timeline
//!
//! Holds at most one open in-memory layer, a queue of frozen in-memory
//! layers waiting to be flushed, and the historic persistent layers.
//! Readers take a snapshot of `Arc`s and never block writers for long.

use super::{Layer, PersistentLayer};
use crate::memtable::InMemoryLayer;
use crate::{Key, Lsn, Record, Result, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;

/// All layers of a timeline
#[derive(Default)]
pub struct LayerMap {
    open: Option<Arc<InMemoryLayer>>,
    frozen: VecDeque<Arc<InMemoryLayer>>,
    historic: Vec<Arc<PersistentLayer>>,
}

impl LayerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_layer(&self) -> Option<&Arc<InMemoryLayer>> {
        self.open.as_ref()
    }

    /// The open layer, created lazily starting at `start_lsn`
    pub fn get_or_create_open(&mut self, start_lsn: Lsn) -> Arc<InMemoryLayer> {
        self.open
            .get_or_insert_with(|| Arc::new(InMemoryLayer::new(start_lsn)))
            .clone()
    }

    /// Freeze the open layer at `end_lsn` and queue it for flushing
    pub fn freeze_open(&mut self, end_lsn: Lsn) -> Option<Arc<InMemoryLayer>> {
        let layer = self.open.take()?;
        layer.freeze(end_lsn);
        self.frozen.push_back(layer.clone());
        Some(layer)
    }

    /// Oldest frozen layer, the next one to flush
    pub fn oldest_frozen(&self) -> Option<Arc<InMemoryLayer>> {
        self.frozen.front().cloned()
    }

    pub fn frozen_count(&self) -> usize {
        self.frozen.len()
    }

    /// Replace the oldest frozen layer with the persistent layer it was flushed to
    pub fn finish_flush(&mut self, frozen: &Arc<InMemoryLayer>, flushed: Option<Arc<PersistentLayer>>) {
        if let Some(front) = self.frozen.front() {
            if Arc::ptr_eq(front, frozen) {
                self.frozen.pop_front();
            }
        }
        if let Some(layer) = flushed {
            self.historic.push(layer);
        }
    }

    pub fn insert_historic(&mut self, layer: Arc<PersistentLayer>) {
        self.historic.push(layer);
    }

    /// Atomically swap `remove` for `add`
    pub fn replace_historic(&mut self, remove: &[Arc<PersistentLayer>], add: Vec<Arc<PersistentLayer>>) {
        self.historic
            .retain(|l| !remove.iter().any(|r| Arc::ptr_eq(l, r)));
        self.historic.extend(add);
    }

    pub fn historic(&self) -> &[Arc<PersistentLayer>] {
        &self.historic
    }

    /// Full key range delta layers, oldest first
    pub fn l0_deltas(&self) -> Vec<Arc<PersistentLayer>> {
        let mut layers: Vec<_> = self
            .historic
            .iter()
            .filter(|l| !l.is_image() && l.name().is_full_key_range())
            .cloned()
            .collect();
        layers.sort_by_key(|l| l.name().lsn_range.start);
        layers
    }

    /// Newest full key range image at or below `lsn`
    pub fn newest_full_image(&self, lsn: Lsn) -> Option<Arc<PersistentLayer>> {
        self.historic
            .iter()
            .filter(|l| l.is_image() && l.name().is_full_key_range())
            .filter(|l| l.name().lsn_range.start <= lsn)
            .max_by_key(|l| l.name().lsn_range.start)
            .cloned()
    }

    /// Sum of historic layer file sizes
    pub fn historic_size(&self) -> u64 {
        self.historic.iter().map(|l| l.file_size()).sum()
    }

    /// Names of all historic layers
    pub fn historic_names(&self) -> Vec<String> {
        self.historic.iter().map(|l| l.file_name().to_string()).collect()
    }

    pub fn snapshot(&self) -> LayerSnapshot {
        let mut in_memory: Vec<_> = self.frozen.iter().cloned().collect();
        if let Some(open) = &self.open {
            in_memory.push(open.clone());
        }
        LayerSnapshot {
            historic: self.historic.clone(),
            in_memory,
        }
    }
}

/// Point-in-time view of a layer map
#[derive(Clone, Default)]
pub struct LayerSnapshot {
    pub historic: Vec<Arc<PersistentLayer>>,
    pub in_memory: Vec<Arc<InMemoryLayer>>,
}

impl LayerSnapshot {
    pub fn layers(&self) -> Vec<&dyn Layer> {
        self.historic
            .iter()
            .map(|l| l.as_ref() as &dyn Layer)
            .chain(self.in_memory.iter().map(|l| l.as_ref() as &dyn Layer))
            .collect()
    }

    pub fn reconstruct(&self, keys: &Range<Key>, lsn: Lsn) -> Result<Reconstructed> {
        reconstruct(&self.layers(), keys, lsn)
    }
}

/// Per-key state of one timeline's own layers at an LSN
#[derive(Debug, Default)]
pub struct Reconstructed {
    /// Newest value per key; tombstones mark keys known to be absent
    pub entries: BTreeMap<Key, Value>,
    /// Key ranges with an image at or below the requested LSN
    pub image_coverage: Vec<Range<Key>>,
}

impl Reconstructed {
    /// Whether this timeline alone decides the state of `key`
    pub fn resolves(&self, key: &Key) -> bool {
        self.entries.contains_key(key) || self.image_coverage.iter().any(|r| r.contains(key))
    }

    /// Live keys and their values
    pub fn live(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries
            .iter()
            .filter(|(_, v)| matches!(v, Value::Put(_)))
    }
}

/// Resolve the state of `keys` at `lsn` from a set of layers
///
/// For each key the newest record at or below `lsn` wins. An image at LSN
/// `I` covering a key that it does not contain proves the key absent at
/// `I`, so any older record for that key is shadowed.
pub fn reconstruct(layers: &[&dyn Layer], keys: &Range<Key>, lsn: Lsn) -> Result<Reconstructed> {
    let mut newest: BTreeMap<Key, (Lsn, Value)> = BTreeMap::new();
    let mut images: Vec<(Range<Key>, Lsn)> = Vec::new();
    let mut buf: Vec<Record> = Vec::new();

    for layer in layers {
        let lsn_range = layer.lsn_range();
        if lsn_range.start > lsn {
            continue;
        }
        if layer.is_image() {
            images.push((layer.key_range(), lsn_range.start));
        }
        buf.clear();
        layer.collect_records(keys, lsn, &mut buf)?;
        for record in buf.drain(..) {
            match newest.entry(record.key) {
                Entry::Vacant(e) => {
                    e.insert((record.lsn, record.value));
                }
                Entry::Occupied(mut e) => {
                    if record.lsn >= e.get().0 {
                        e.insert((record.lsn, record.value));
                    }
                }
            }
        }
    }

    let entries = newest
        .into_iter()
        .map(|(key, (rec_lsn, value))| {
            let shadowed = images
                .iter()
                .any(|(range, image_lsn)| range.contains(&key) && *image_lsn > rec_lsn);
            (key, if shadowed { Value::Tombstone } else { value })
        })
        .collect();

    Ok(Reconstructed {
        entries,
        image_coverage: images.into_iter().map(|(range, _)| range).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerWriter;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn put(key: Key, lsn: u64, v: &'static str) -> Record {
        Record::new(key, Lsn(lsn), Value::Put(Bytes::from_static(v.as_bytes())))
    }

    #[test]
    fn test_newest_record_wins_across_layers() {
        let temp_dir = TempDir::new().unwrap();
        let a = Key::new(1, 1, 0);
        let b = Key::new(1, 1, 1);

        let mut writer =
            LayerWriter::new_delta(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(1)..Lsn(10));
        writer.add(&put(a, 1, "a1")).unwrap();
        writer.add(&put(b, 2, "b1")).unwrap();
        let delta = Arc::new(writer.finish().unwrap());

        let open = InMemoryLayer::new(Lsn(10));
        open.put(put(a, 12, "a2"));
        open.put(Record::new(b, Lsn(13), Value::Tombstone));

        let layers: Vec<&dyn Layer> = vec![delta.as_ref(), &open];
        let state = reconstruct(&layers, &(Key::MIN..Key::MAX), Lsn(12)).unwrap();
        assert_eq!(state.entries[&a], Value::Put(Bytes::from_static(b"a2")));
        assert_eq!(state.entries[&b], Value::Put(Bytes::from_static(b"b1")));

        let state = reconstruct(&layers, &(Key::MIN..Key::MAX), Lsn(20)).unwrap();
        assert_eq!(state.live().count(), 1);
        assert_eq!(state.live().map(|(_, v)| v.logical_size()).sum::<u64>(), 2);
    }

    #[test]
    fn test_image_shadows_older_records() {
        let temp_dir = TempDir::new().unwrap();
        let a = Key::new(1, 1, 0);
        let b = Key::new(1, 1, 1);

        let mut writer =
            LayerWriter::new_delta(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(1)..Lsn(10));
        writer.add(&put(a, 1, "a1")).unwrap();
        writer.add(&put(b, 2, "b1")).unwrap();
        let delta = Arc::new(writer.finish().unwrap());

        // image at 9 only holds `a`: `b` was removed before 9
        let mut writer = LayerWriter::new_image(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(9));
        writer.add(&put(a, 9, "a1")).unwrap();
        let image = Arc::new(writer.finish().unwrap());

        let layers: Vec<&dyn Layer> = vec![delta.as_ref(), image.as_ref()];
        let state = reconstruct(&layers, &(Key::MIN..Key::MAX), Lsn(9)).unwrap();
        assert_eq!(state.live().count(), 1);
        assert!(state.resolves(&Key::new(7, 7, 7)));

        // below the image only the delta applies
        let state = reconstruct(&layers, &(Key::MIN..Key::MAX), Lsn(5)).unwrap();
        assert_eq!(state.live().count(), 2);
        assert!(!state.resolves(&Key::new(7, 7, 7)));
    }

    #[test]
    fn test_layer_map_freeze_and_flush() {
        let temp_dir = TempDir::new().unwrap();
        let mut map = LayerMap::new();
        let open = map.get_or_create_open(Lsn(1));
        open.put(put(Key::new(0, 0, 1), 1, "x"));

        let frozen = map.freeze_open(Lsn(2)).unwrap();
        assert!(map.open_layer().is_none());
        assert_eq!(map.frozen_count(), 1);
        assert_eq!(map.snapshot().in_memory.len(), 1);

        let mut writer =
            LayerWriter::new_delta(temp_dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(1)..Lsn(2));
        for record in frozen.iter() {
            writer.add(&record).unwrap();
        }
        let layer = Arc::new(writer.finish().unwrap());
        map.finish_flush(&frozen, Some(layer.clone()));

        assert_eq!(map.frozen_count(), 0);
        assert_eq!(map.l0_deltas().len(), 1);
        assert_eq!(map.historic_size(), layer.file_size());

        map.replace_historic(&[layer], Vec::new());
        assert!(map.historic().is_empty());
    }
}
