//! Upload manifest (`index_part.json`)

use crate::{Lsn, PageStoreError, Result, TimelineId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Remote description of a timeline: the layers that make it up and the
/// LSN up to which they hold all ingested data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadManifest {
    pub format_version: u32,
    /// Incremented on every upload
    pub generation: u64,
    pub disk_consistent_lsn: Lsn,
    #[serde(default)]
    pub ancestor_timeline: Option<TimelineId>,
    #[serde(default)]
    pub ancestor_lsn: Lsn,
    /// Layer file name to file size
    pub layers: BTreeMap<String, u64>,
}

impl UploadManifest {
    pub fn new(
        disk_consistent_lsn: Lsn,
        ancestor_timeline: Option<TimelineId>,
        ancestor_lsn: Lsn,
        layers: BTreeMap<String, u64>,
    ) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            generation: 0,
            disk_consistent_lsn,
            ancestor_timeline,
            ancestor_lsn,
            layers,
        }
    }

    /// Same content, ignoring the generation counter
    pub fn same_content(&self, other: &UploadManifest) -> bool {
        self.disk_consistent_lsn == other.disk_consistent_lsn
            && self.ancestor_timeline == other.ancestor_timeline
            && self.ancestor_lsn == other.ancestor_lsn
            && self.layers == other.layers
    }

    /// Total bytes of referenced layers
    pub fn total_size(&self) -> u64 {
        self.layers.values().sum()
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec_pretty(self)
            .map(Bytes::from)
            .map_err(|e| PageStoreError::InvalidFormat(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let manifest: UploadManifest = serde_json::from_slice(data)
            .map_err(|e| PageStoreError::InvalidFormat(format!("index_part.json: {}", e)))?;
        if manifest.format_version != MANIFEST_FORMAT_VERSION {
            return Err(PageStoreError::InvalidFormat(format!(
                "Unsupported manifest version {}",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_json() {
        let mut layers = BTreeMap::new();
        layers.insert("layer_a".to_string(), 100);
        layers.insert("layer_b".to_string(), 50);
        let mut manifest = UploadManifest::new(Lsn(0x1000), None, Lsn::INVALID, layers);

        let parsed = UploadManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.total_size(), 150);

        let json = String::from_utf8(manifest.to_bytes().unwrap().to_vec()).unwrap();
        assert!(json.contains("\"0/1000\""));

        let before = manifest.clone();
        manifest.generation += 1;
        assert!(manifest.same_content(&before));
        assert_ne!(manifest, before);
    }
}
