//! Remote storage replication
//!
//! Persistent layers and a per-timeline manifest (`index_part.json`) are
//! copied to a remote object store. The remote copy is always a consistent
//! prefix of the local state: a manifest is uploaded only after every layer
//! it references, and a layer is deleted remotely only after a manifest
//! that no longer references it.
//!
//! Remote layout:
//! ```text
//! tenants/<tenant>/timelines/<timeline>/<layer file name>
//! tenants/<tenant>/timelines/<timeline>/index_part.json
//! ```

mod local_fs;
mod manifest;
mod memory;
mod uploader;

pub use local_fs::LocalFsStorage;
pub use manifest::{UploadManifest, MANIFEST_FORMAT_VERSION};
pub use memory::InMemoryStorage;
pub use uploader::{RemoteTimelineClient, TimelineIndex, UploadConfig, UploadOp};

use crate::{Result, TenantId, TimelineId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the manifest object in a timeline prefix
pub const INDEX_PART_NAME: &str = "index_part.json";

/// Path of an object in remote storage, '/'-separated
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn timeline_prefix(tenant_id: TenantId, timeline_id: TimelineId) -> Self {
        Self(format!("tenants/{}/timelines/{}/", tenant_id, timeline_id))
    }

    pub fn layer(tenant_id: TenantId, timeline_id: TimelineId, file_name: &str) -> Self {
        Self(format!(
            "tenants/{}/timelines/{}/{}",
            tenant_id, timeline_id, file_name
        ))
    }

    pub fn index_part(tenant_id: TenantId, timeline_id: TimelineId) -> Self {
        Self::layer(tenant_id, timeline_id, INDEX_PART_NAME)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component
    pub fn object_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minimal object store interface
///
/// Calls block; async callers go through `spawn_blocking`. Failures are
/// reported as `UploadTransient` and retried by the caller.
pub trait RemoteStorage: Send + Sync + 'static {
    fn put(&self, path: &RemotePath, data: Bytes) -> Result<()>;

    /// `None` if the object does not exist
    fn get(&self, path: &RemotePath) -> Result<Option<Bytes>>;

    /// Deleting a missing object succeeds
    fn delete(&self, path: &RemotePath) -> Result<()>;

    /// All objects whose path starts with `prefix`
    fn list(&self, prefix: &RemotePath) -> Result<Vec<RemotePath>>;
}

/// Remote storage backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteStorageConfig {
    /// Objects stored as files under a local directory
    LocalFs { path: PathBuf },
    /// Process-local map, lost on restart
    InMemory,
}

impl RemoteStorageConfig {
    pub fn build(&self) -> Result<Arc<dyn RemoteStorage>> {
        Ok(match self {
            RemoteStorageConfig::LocalFs { path } => Arc::new(LocalFsStorage::new(path.clone())?),
            RemoteStorageConfig::InMemory => Arc::new(InMemoryStorage::new()),
        })
    }
}
