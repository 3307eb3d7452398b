//! In-memory remote storage, with failure injection for tests

use super::{RemotePath, RemoteStorage};
use crate::{PageStoreError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    objects: RwLock<BTreeMap<RemotePath, Bytes>>,
    fail_next: AtomicUsize,
    puts: AtomicUsize,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient error
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful puts so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Names of all stored objects
    pub fn keys(&self) -> Vec<RemotePath> {
        self.objects.read().keys().cloned().collect()
    }

    fn maybe_fail(&self, op: &str, path: &RemotePath) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(PageStoreError::UploadTransient(format!(
                "injected failure on {} {}",
                op, path
            )));
        }
        Ok(())
    }
}

impl RemoteStorage for InMemoryStorage {
    fn put(&self, path: &RemotePath, data: Bytes) -> Result<()> {
        self.maybe_fail("put", path)?;
        self.objects.write().insert(path.clone(), data);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, path: &RemotePath) -> Result<Option<Bytes>> {
        self.maybe_fail("get", path)?;
        Ok(self.objects.read().get(path).cloned())
    }

    fn delete(&self, path: &RemotePath) -> Result<()> {
        self.maybe_fail("delete", path)?;
        self.objects.write().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &RemotePath) -> Result<Vec<RemotePath>> {
        self.maybe_fail("list", prefix)?;
        Ok(self
            .objects
            .read()
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.as_str().starts_with(prefix.as_str()))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_injection() {
        let storage = InMemoryStorage::new();
        let path = RemotePath::new("a/b");

        storage.fail_next(2);
        assert!(storage.put(&path, Bytes::from_static(b"x")).is_err());
        assert!(storage.put(&path, Bytes::from_static(b"x")).is_err());
        storage.put(&path, Bytes::from_static(b"x")).unwrap();

        assert_eq!(storage.put_count(), 1);
        assert_eq!(storage.list(&RemotePath::new("a/")).unwrap(), vec![path]);
    }
}
