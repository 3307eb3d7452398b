//! Size accounting
//!
//! Two numbers are kept per timeline:
//! - logical size: the sum of the payload sizes of all live keys, updated
//!   incrementally on ingest through a live-key directory
//! - physical size: the bytes of persistent layer files on local disk,
//!   updated whenever a layer file is created or removed
//!
//! Both can be recomputed from scratch (`non_incremental`) and must agree
//! with the incremental value.

use crate::layer::LayerName;
use crate::quota::QuotaGuard;
use crate::{Delta, Key, Lsn, PageStoreError, Record, Result, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Incremental logical and physical size of one timeline
#[derive(Debug, Default)]
pub struct SizeTracker {
    logical: AtomicU64,
    physical: AtomicU64,
    /// Live keys and their payload size
    directory: Mutex<BTreeMap<Key, u64>>,
}

/// Inverse of one directory change, for rollback
enum Undo {
    Restore(Key, u64),
    Remove(Key),
}

impl SizeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a known set of live keys (load or branch)
    pub fn with_directory(directory: BTreeMap<Key, u64>) -> Self {
        let logical = directory.values().sum();
        Self {
            logical: AtomicU64::new(logical),
            physical: AtomicU64::new(0),
            directory: Mutex::new(directory),
        }
    }

    /// Incremental logical size
    pub fn logical(&self) -> u64 {
        self.logical.load(Ordering::Acquire)
    }

    /// Incremental physical size
    pub fn physical(&self) -> u64 {
        self.physical.load(Ordering::Acquire)
    }

    pub fn live_keys(&self) -> usize {
        self.directory.lock().len()
    }

    pub fn add_physical(&self, bytes: u64) {
        self.physical.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub_physical(&self, bytes: u64) {
        let _ = self
            .physical
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(bytes)));
    }

    pub fn set_physical(&self, bytes: u64) {
        self.physical.store(bytes, Ordering::Release);
    }

    /// Expand `deltas` at `lsn` into records and account for them
    ///
    /// Relation and database drops become one tombstone per live key. When
    /// a quota is given and the batch would grow the logical size past the
    /// limit, nothing is applied and `QuotaExceeded` is returned.
    pub fn apply(&self, lsn: Lsn, deltas: &[Delta], quota: Option<&QuotaGuard>) -> Result<Vec<Record>> {
        self.apply_with(lsn, deltas, quota, || Ok(()))
    }

    /// Like [`apply`](Self::apply), running `persist` after admission and
    /// before the new size becomes visible; an error from `persist` rolls
    /// the batch back
    pub fn apply_with(
        &self,
        lsn: Lsn,
        deltas: &[Delta],
        quota: Option<&QuotaGuard>,
        persist: impl FnOnce() -> Result<()>,
    ) -> Result<Vec<Record>> {
        let mut directory = self.directory.lock();
        let mut undo = Vec::new();
        let mut records = Vec::with_capacity(deltas.len());
        let mut growth: i64 = 0;

        for delta in deltas {
            match delta {
                Delta::Put { key, value } => {
                    let new = value.len() as u64;
                    match directory.insert(*key, new) {
                        Some(old) => {
                            undo.push(Undo::Restore(*key, old));
                            growth += new as i64 - old as i64;
                        }
                        None => {
                            undo.push(Undo::Remove(*key));
                            growth += new as i64;
                        }
                    }
                    records.push(Record::new(*key, lsn, Value::Put(value.clone())));
                }
                Delta::Delete { key } => {
                    growth += remove_key(&mut directory, &mut undo, *key);
                    records.push(Record::new(*key, lsn, Value::Tombstone));
                }
                Delta::DropRelation { database, relation } => {
                    let keys = keys_in(&directory, Key::relation_range(*database, *relation));
                    for key in keys {
                        growth += remove_key(&mut directory, &mut undo, key);
                        records.push(Record::new(key, lsn, Value::Tombstone));
                    }
                }
                Delta::DropDatabase { database } => {
                    let keys = keys_in(&directory, Key::database_range(*database));
                    for key in keys {
                        growth += remove_key(&mut directory, &mut undo, key);
                        records.push(Record::new(key, lsn, Value::Tombstone));
                    }
                }
            }
        }

        let commit = || {
            persist()?;
            self.commit_growth(growth);
            Ok(())
        };
        let admitted = match quota {
            Some(quota) => quota.admit(self, growth, commit),
            None => commit(),
        };
        if let Err(e) = admitted {
            for change in undo.into_iter().rev() {
                match change {
                    Undo::Restore(key, size) => {
                        directory.insert(key, size);
                    }
                    Undo::Remove(key) => {
                        directory.remove(&key);
                    }
                }
            }
            return Err(e);
        }
        Ok(records)
    }

    fn commit_growth(&self, growth: i64) {
        if growth >= 0 {
            self.logical.fetch_add(growth as u64, Ordering::AcqRel);
        } else {
            let shrink = growth.unsigned_abs();
            let _ = self
                .logical
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(shrink)));
        }
    }
}

fn remove_key(directory: &mut BTreeMap<Key, u64>, undo: &mut Vec<Undo>, key: Key) -> i64 {
    match directory.remove(&key) {
        Some(old) => {
            undo.push(Undo::Restore(key, old));
            -(old as i64)
        }
        None => 0,
    }
}

fn keys_in(directory: &BTreeMap<Key, u64>, range: std::ops::Range<Key>) -> Vec<Key> {
    directory.range(range).map(|(k, _)| *k).collect()
}

/// Recompute physical size: sum of files in `dir` named like layers
pub fn physical_non_incremental(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if LayerName::parse(name).is_some() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Compare an incremental counter with its recomputed value
pub fn check_drift(kind: &'static str, incremental: u64, non_incremental: u64) -> Result<()> {
    if incremental != non_incremental {
        return Err(PageStoreError::SizeDrift {
            kind,
            incremental,
            non_incremental,
        });
    }
    Ok(())
}
