//! Pagestore Core - multi-tenant layered storage for WAL-derived page history
//!
//! Incoming WAL deltas are buffered per timeline in an in-memory layer and
//! checkpointed into immutable layer files:
//!
//! - **WAL**: every ingested batch is logged before it becomes visible
//! - **Layers**: an open in-memory layer, frozen layers waiting for flush and
//!   persistent delta/image layers on disk
//! - **Size tracking**: incremental logical and physical sizes, checked
//!   against full recomputations
//! - **Quota**: logical size limits enforced before a batch is admitted
//! - **Remote replication**: asynchronous, ordered upload of layers and
//!   manifests
//! - **Compaction and GC**: merging of level 0 deltas and reclamation of
//!   history older than the PITR window
//!
//! Tenants own timelines; a timeline may branch from another at an LSN.

pub mod command;
pub mod compaction;
pub mod crashsafe;
pub mod layer;
pub mod memtable;
pub mod quota;
pub mod remote;
pub mod size;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{PageStoreError, Result};
pub use types::*;

/// Pagestore version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Open layer size that triggers a checkpoint (256MB)
    pub const CHECKPOINT_DISTANCE: u64 = 256 * 1024 * 1024;

    /// Age after which an idle open layer is flushed anyway
    pub const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    /// Target size of compacted delta layers (128MB)
    pub const COMPACTION_TARGET_SIZE: u64 = 128 * 1024 * 1024;

    pub const COMPACTION_PERIOD: Duration = Duration::from_secs(20);

    /// Level 0 delta layers that trigger compaction
    pub const COMPACTION_THRESHOLD: usize = 10;

    pub const GC_PERIOD: Duration = Duration::from_secs(60 * 60);

    /// History kept readable by background GC (7 days)
    pub const PITR_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Delta layers above the newest image before GC writes a new image
    pub const IMAGE_CREATION_THRESHOLD: usize = 3;

    pub const SIZE_RECONCILE_PERIOD: Duration = Duration::from_secs(60);

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
}
