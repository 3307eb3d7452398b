//! Timeline metadata: the local manifest of a timeline directory
//!
//! Lists the layer files that make up the timeline together with the LSNs
//! they are consistent up to. Written atomically; any layer file in the
//! directory that is not listed is a leftover of an interrupted operation.

use crate::crashsafe;
use crate::{Lsn, PageStoreError, Result, TimelineId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

pub const METADATA_FILE_NAME: &str = "metadata";
pub const METADATA_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMetadata {
    pub format_version: u32,
    pub disk_consistent_lsn: Lsn,
    #[serde(default)]
    pub ancestor_timeline: Option<TimelineId>,
    #[serde(default)]
    pub ancestor_lsn: Lsn,
    #[serde(default)]
    pub latest_gc_cutoff_lsn: Lsn,
    pub created_at: DateTime<Utc>,
    pub layers: BTreeSet<String>,
}

impl TimelineMetadata {
    pub fn new(disk_consistent_lsn: Lsn, ancestor_timeline: Option<TimelineId>, ancestor_lsn: Lsn) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            disk_consistent_lsn,
            ancestor_timeline,
            ancestor_lsn,
            latest_gc_cutoff_lsn: Lsn::INVALID,
            created_at: Utc::now(),
            layers: BTreeSet::new(),
        }
    }

    pub fn load(timeline_dir: &Path) -> Result<Self> {
        let path = timeline_dir.join(METADATA_FILE_NAME);
        let data = std::fs::read(&path)?;
        let metadata: TimelineMetadata = serde_json::from_slice(&data)
            .map_err(|e| PageStoreError::corrupt(&path, format!("unreadable metadata: {}", e)))?;
        if metadata.format_version != METADATA_FORMAT_VERSION {
            return Err(PageStoreError::InvalidFormat(format!(
                "Unsupported metadata version {} in {:?}",
                metadata.format_version, path
            )));
        }
        Ok(metadata)
    }

    /// Replace the metadata file durably
    pub fn save(&self, timeline_dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| PageStoreError::InvalidFormat(e.to_string()))?;
        crashsafe::write_atomic(&timeline_dir.join(METADATA_FILE_NAME), &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let ancestor = TimelineId::generate();
        let mut metadata = TimelineMetadata::new(Lsn(0x2000), Some(ancestor), Lsn(0x1000));
        metadata.layers.insert("layer_a".to_string());
        metadata.latest_gc_cutoff_lsn = Lsn(0x1800);

        metadata.save(temp_dir.path()).unwrap();
        let loaded = TimelineMetadata::load(temp_dir.path()).unwrap();
        assert_eq!(loaded, metadata);

        // overwrite keeps a single file
        metadata.disk_consistent_lsn = Lsn(0x3000);
        metadata.save(temp_dir.path()).unwrap();
        assert_eq!(TimelineMetadata::load(temp_dir.path()).unwrap().disk_consistent_lsn, Lsn(0x3000));
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_garbage_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(METADATA_FILE_NAME), b"{not json").unwrap();
        let err = TimelineMetadata::load(temp_dir.path()).unwrap_err();
        assert!(err.is_corruption());
    }
}
