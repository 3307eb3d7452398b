//! Remote storage backed by a local directory

use super::{RemotePath, RemoteStorage};
use crate::crashsafe;
use crate::{PageStoreError, Result};
use bytes::Bytes;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Stores each object as a file under `root`
#[derive(Debug)]
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, path: &RemotePath) -> PathBuf {
        self.root.join(path.as_str())
    }

    fn walk(&self, dir: &Path, out: &mut Vec<RemotePath>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(transient(e)),
        };
        for entry in entries {
            let path = entry.map_err(transient)?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if !crashsafe::is_temp_file(&path) {
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
                    out.push(RemotePath::new(key.join("/")));
                }
            }
        }
        Ok(())
    }
}

fn transient(e: std::io::Error) -> PageStoreError {
    PageStoreError::UploadTransient(e.to_string())
}

impl RemoteStorage for LocalFsStorage {
    fn put(&self, path: &RemotePath, data: Bytes) -> Result<()> {
        let target = self.object_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(transient)?;
        }
        crashsafe::write_atomic(&target, &data).map_err(|e| PageStoreError::UploadTransient(e.to_string()))
    }

    fn get(&self, path: &RemotePath) -> Result<Option<Bytes>> {
        match fs::read(self.object_path(path)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transient(e)),
        }
    }

    fn delete(&self, path: &RemotePath) -> Result<()> {
        match fs::remove_file(self.object_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(transient(e)),
        }
    }

    fn list(&self, prefix: &RemotePath) -> Result<Vec<RemotePath>> {
        // walk the deepest directory implied by the prefix
        let dir_part = match prefix.as_str().rfind('/') {
            Some(idx) => &prefix.as_str()[..idx],
            None => "",
        };
        let mut out = Vec::new();
        self.walk(&self.root.join(dir_part), &mut out)?;
        out.retain(|p| p.as_str().starts_with(prefix.as_str()));
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_fs_put_get_list_delete() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(temp_dir.path().to_path_buf()).unwrap();

        let a = RemotePath::new("tenants/t1/timelines/tl1/layer_a");
        let b = RemotePath::new("tenants/t1/timelines/tl1/index_part.json");
        let c = RemotePath::new("tenants/t2/timelines/tl9/layer_c");
        storage.put(&a, Bytes::from_static(b"aaa")).unwrap();
        storage.put(&b, Bytes::from_static(b"{}")).unwrap();
        storage.put(&c, Bytes::from_static(b"ccc")).unwrap();

        assert_eq!(storage.get(&a).unwrap().unwrap(), Bytes::from_static(b"aaa"));
        assert!(storage.get(&RemotePath::new("missing")).unwrap().is_none());

        let listed = storage.list(&RemotePath::new("tenants/t1/timelines/tl1/")).unwrap();
        assert_eq!(listed, vec![b.clone(), a.clone()]);

        storage.delete(&a).unwrap();
        storage.delete(&a).unwrap();
        assert_eq!(storage.list(&RemotePath::new("tenants/t1/")).unwrap(), vec![b]);
    }
}
