//! Storage engine: tenants, timelines and the registry that owns them
//!
//! On-disk layout under `data_dir`:
//! ```text
//! tenants/<tenant>/tenant.json
//! tenants/<tenant>/timelines/<timeline>/metadata
//! tenants/<tenant>/timelines/<timeline>/<layer files>
//! tenants/<tenant>/timelines/<timeline>/wal/wal_<LSN>.log
//! ```

mod checkpoint;
mod metadata;
mod registry;
mod tasks;
mod tenant;
mod timeline;

pub use metadata::{TimelineMetadata, METADATA_FILE_NAME, METADATA_FORMAT_VERSION};
pub use registry::{CreateTimeline, TenantRegistry};
pub use tenant::{Tenant, TenantStatus};
pub use timeline::{Timeline, TimelineDetail};

#[cfg(test)]
pub(crate) use timeline::tests::new_timeline as timeline_for_tests;

use crate::quota::QuotaScope;
use crate::remote::{RemoteStorageConfig, UploadConfig};
use crate::types::duration_format;
use crate::wal::SyncPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Settings for tenants created without overrides
    pub default_tenant_conf: TenantConf,
    /// WAL configuration
    pub wal: WalSettings,
    /// Remote storage backend; replication is off when absent
    pub remote_storage: Option<RemoteStorageConfig>,
    /// Upload queue settings
    pub upload: UploadConfig,
    /// Run periodic compaction, GC, checkpoint timeout and size reconciliation
    pub background_tasks: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            default_tenant_conf: TenantConf::default(),
            wal: WalSettings::default(),
            remote_storage: None,
            upload: UploadConfig::default(),
            background_tasks: true,
        }
    }
}

/// WAL settings shared by all timelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSettings {
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

/// Per-tenant tuning, persisted in `tenant.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConf {
    /// Open layer bytes that trigger a freeze
    pub checkpoint_distance: u64,
    /// Open layers older than this are flushed by the background loop
    #[serde(with = "duration_format")]
    pub checkpoint_timeout: Duration,
    /// Target size of compaction output layers
    pub compaction_target_size: u64,
    #[serde(with = "duration_format")]
    pub compaction_period: Duration,
    /// Number of L0 delta layers that triggers compaction
    pub compaction_threshold: usize,
    #[serde(with = "duration_format")]
    pub gc_period: Duration,
    /// History kept readable by GC
    #[serde(with = "duration_format")]
    pub pitr_interval: Duration,
    /// Delta layers above the newest image that make GC write a new image
    pub image_creation_threshold: usize,
    /// Logical size limit in bytes
    pub max_logical_size: Option<u64>,
    pub quota_scope: QuotaScope,
    #[serde(with = "duration_format")]
    pub size_reconcile_period: Duration,
}

impl Default for TenantConf {
    fn default() -> Self {
        use crate::config;
        Self {
            checkpoint_distance: config::CHECKPOINT_DISTANCE,
            checkpoint_timeout: config::CHECKPOINT_TIMEOUT,
            compaction_target_size: config::COMPACTION_TARGET_SIZE,
            compaction_period: config::COMPACTION_PERIOD,
            compaction_threshold: config::COMPACTION_THRESHOLD,
            gc_period: config::GC_PERIOD,
            pitr_interval: config::PITR_INTERVAL,
            image_creation_threshold: config::IMAGE_CREATION_THRESHOLD,
            max_logical_size: None,
            quota_scope: QuotaScope::default(),
            size_reconcile_period: config::SIZE_RECONCILE_PERIOD,
        }
    }
}
