//! Timeline - one branch of WAL-derived history

use super::metadata::{TimelineMetadata, METADATA_FILE_NAME};
use super::{TenantConf, WalSettings};
use crate::crashsafe;
use crate::layer::{LayerMap, LayerName, LayerSnapshot, PersistentLayer};
use crate::quota::QuotaGuard;
use crate::remote::{RemoteStorage, RemoteTimelineClient, TimelineIndex, UploadConfig};
use crate::size::{self, SizeTracker};
use crate::wal::{WalConfig, WalEntry, WalReader, WalWriter};
use crate::{Delta, Key, Lsn, PageStoreError, Result, TenantId, TimelineId, Value};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Checkpoint times remembered for PITR cutoff lookups
pub(super) const LSN_HISTORY_LEN: usize = 1024;

/// Everything a timeline borrows from its tenant
#[derive(Clone)]
pub(crate) struct TimelineResources {
    pub conf: TenantConf,
    pub wal: WalSettings,
    pub quota: Arc<QuotaGuard>,
    pub remote: Option<(Arc<dyn RemoteStorage>, UploadConfig)>,
    pub cancel: CancellationToken,
}

/// A timeline: layers, WAL, size counters and replication state
pub struct Timeline {
    pub(crate) tenant_id: TenantId,
    pub(crate) timeline_id: TimelineId,
    pub(crate) dir: PathBuf,
    pub(crate) conf: TenantConf,
    pub(crate) ancestor: Option<Arc<Timeline>>,
    pub(crate) ancestor_lsn: Lsn,

    pub(crate) layers: RwLock<LayerMap>,
    pub(crate) wal: WalWriter,
    pub(crate) size: Arc<SizeTracker>,
    pub(crate) quota: Arc<QuotaGuard>,
    pub(crate) remote: Option<Arc<RemoteTimelineClient>>,

    /// Single ingest writer; also held while freezing
    pub(crate) write_lock: Mutex<()>,
    /// Serializes flushes of frozen layers
    pub(crate) flush_lock: Mutex<()>,
    /// Serializes compaction and GC
    pub(crate) layer_removal_cs: Mutex<()>,
    metadata_lock: Mutex<()>,

    last_record_lsn: watch::Sender<Lsn>,
    pub(crate) disk_consistent_lsn: AtomicU64,
    pub(crate) latest_gc_cutoff_lsn: AtomicU64,
    created_at: DateTime<Utc>,
    /// (checkpoint time, disk_consistent_lsn), oldest first
    pub(crate) lsn_history: Mutex<VecDeque<(DateTime<Utc>, Lsn)>>,

    pub(crate) cancel: CancellationToken,
}

/// Status of one timeline as reported over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineDetail {
    pub tenant_id: TenantId,
    pub timeline_id: TimelineId,
    pub ancestor_timeline_id: Option<TimelineId>,
    pub ancestor_lsn: Option<Lsn>,
    pub last_record_lsn: Lsn,
    pub disk_consistent_lsn: Lsn,
    /// `None` when remote storage is not configured
    pub remote_consistent_lsn: Option<Lsn>,
    pub latest_gc_cutoff_lsn: Lsn,
    pub current_logical_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_logical_size_non_incremental: Option<u64>,
    pub current_physical_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_physical_size_non_incremental: Option<u64>,
    pub layer_count: usize,
    pub in_memory_layer_count: usize,
    pub upload_queue_len: usize,
    pub created_at: DateTime<Utc>,
}

impl Timeline {
    /// Create a new timeline directory, optionally branched from `ancestor` at an LSN
    pub(crate) fn create(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        dir: PathBuf,
        ancestor: Option<(Arc<Timeline>, Lsn)>,
        resources: TimelineResources,
    ) -> Result<Arc<Self>> {
        if dir.exists() {
            return Err(PageStoreError::AlreadyExists(format!("timeline {}", timeline_id)));
        }

        let (ancestor, ancestor_lsn) = match ancestor {
            Some((timeline, lsn)) => (Some(timeline), lsn),
            None => (None, Lsn::INVALID),
        };

        // a branch starts out as its ancestor's state at the branch point
        let directory = match &ancestor {
            Some(ancestor) => ancestor
                .state_at(&(Key::MIN..Key::MAX), ancestor_lsn)?
                .into_iter()
                .map(|(key, value)| (key, value.len() as u64))
                .collect(),
            None => BTreeMap::new(),
        };

        crashsafe::create_dir_durable(&dir)?;
        let metadata = TimelineMetadata::new(ancestor_lsn, ancestor.as_ref().map(|a| a.timeline_id), ancestor_lsn);
        metadata.save(&dir)?;

        let wal = WalWriter::new(wal_config(&dir, &resources.wal), ancestor_lsn.next())?;
        let timeline = Self::assemble(
            tenant_id,
            timeline_id,
            dir,
            ancestor,
            &metadata,
            LayerMap::new(),
            SizeTracker::with_directory(directory),
            ancestor_lsn,
            wal,
            resources,
        )?;
        if let Some(remote) = &timeline.remote {
            remote.schedule_manifest_upload(timeline.index());
        }

        info!(
            tenant_id = %tenant_id,
            timeline_id = %timeline_id,
            "Created timeline{}",
            match &timeline.ancestor {
                Some(a) => format!(" branched from {} at {}", a.timeline_id, ancestor_lsn),
                None => String::new(),
            }
        );
        Ok(timeline)
    }

    /// Open an existing timeline directory, replaying WAL above `disk_consistent_lsn`
    pub(crate) fn load(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        dir: PathBuf,
        ancestor: Option<Arc<Timeline>>,
        resources: TimelineResources,
    ) -> Result<Arc<Self>> {
        let metadata = TimelineMetadata::load(&dir)?;
        if metadata.ancestor_timeline != ancestor.as_ref().map(|a| a.timeline_id) {
            return Err(PageStoreError::Internal(format!(
                "timeline {} expects ancestor {:?}",
                timeline_id, metadata.ancestor_timeline
            )));
        }

        let mut layers = LayerMap::new();
        for layer in open_listed_layers(&dir, &metadata)? {
            layers.insert_historic(Arc::new(layer));
        }
        let physical = layers.historic_size();

        let disk_consistent_lsn = metadata.disk_consistent_lsn;
        let directory = materialize(
            &layers.snapshot(),
            ancestor.as_ref(),
            metadata.ancestor_lsn,
            &(Key::MIN..Key::MAX),
            disk_consistent_lsn,
        )?
        .into_iter()
        .map(|(key, value)| (key, value.len() as u64))
        .collect();
        let size = SizeTracker::with_directory(directory);
        size.set_physical(physical);

        // replay is neither quota checked nor logged again
        let mut last_record_lsn = disk_consistent_lsn;
        let entries = WalReader::new(dir.join("wal")).recover_after(disk_consistent_lsn)?;
        let replayed = entries.len();
        for entry in entries {
            if entry.lsn <= last_record_lsn {
                continue;
            }
            let records = size.apply(entry.lsn, &entry.deltas()?, None)?;
            layers
                .get_or_create_open(last_record_lsn.next())
                .put_batch(records);
            last_record_lsn = entry.lsn;
        }

        let wal = WalWriter::new(wal_config(&dir, &resources.wal), last_record_lsn.next())?;
        let timeline = Self::assemble(
            tenant_id,
            timeline_id,
            dir,
            ancestor,
            &metadata,
            layers,
            size,
            last_record_lsn,
            wal,
            resources,
        )?;

        info!(
            tenant_id = %tenant_id,
            timeline_id = %timeline_id,
            "Loaded timeline: {} layers, disk_consistent_lsn {}, replayed {} WAL entries up to {}",
            timeline.layers.read().historic().len(),
            disk_consistent_lsn,
            replayed,
            last_record_lsn
        );
        Ok(timeline)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        dir: PathBuf,
        ancestor: Option<Arc<Timeline>>,
        metadata: &TimelineMetadata,
        layers: LayerMap,
        size: SizeTracker,
        last_record_lsn: Lsn,
        wal: WalWriter,
        resources: TimelineResources,
    ) -> Result<Arc<Self>> {
        let cancel = resources.cancel;
        let remote = match resources.remote {
            Some((storage, config)) => Some(RemoteTimelineClient::new(
                tenant_id,
                timeline_id,
                storage,
                config,
                cancel.child_token(),
            )?),
            None => None,
        };

        let size = Arc::new(size);
        resources.quota.register(&size);

        let mut lsn_history = VecDeque::new();
        lsn_history.push_back((Utc::now(), metadata.disk_consistent_lsn));

        Ok(Arc::new(Self {
            tenant_id,
            timeline_id,
            dir,
            conf: resources.conf,
            ancestor,
            ancestor_lsn: metadata.ancestor_lsn,
            layers: RwLock::new(layers),
            wal,
            size,
            quota: resources.quota,
            remote,
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            layer_removal_cs: Mutex::new(()),
            metadata_lock: Mutex::new(()),
            last_record_lsn: watch::channel(last_record_lsn).0,
            disk_consistent_lsn: AtomicU64::new(metadata.disk_consistent_lsn.0),
            latest_gc_cutoff_lsn: AtomicU64::new(metadata.latest_gc_cutoff_lsn.0),
            created_at: metadata.created_at,
            lsn_history: Mutex::new(lsn_history),
            cancel,
        }))
    }

    /// Resume replication of the loaded layers
    pub(crate) async fn init_remote(&self) -> Result<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let historic = self.layers.read().historic().to_vec();
        remote.init_from_remote(&historic, self.index()).await
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn timeline_id(&self) -> TimelineId {
        self.timeline_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ancestor_timeline_id(&self) -> Option<TimelineId> {
        self.ancestor.as_ref().map(|a| a.timeline_id)
    }

    pub fn ancestor_lsn(&self) -> Lsn {
        self.ancestor_lsn
    }

    pub fn last_record_lsn(&self) -> Lsn {
        *self.last_record_lsn.borrow()
    }

    pub fn disk_consistent_lsn(&self) -> Lsn {
        Lsn(self.disk_consistent_lsn.load(Ordering::Acquire))
    }

    /// `None` when remote storage is not configured
    pub fn remote_consistent_lsn(&self) -> Option<Lsn> {
        self.remote.as_ref().map(|r| r.remote_consistent_lsn())
    }

    pub fn latest_gc_cutoff_lsn(&self) -> Lsn {
        Lsn(self.latest_gc_cutoff_lsn.load(Ordering::Acquire))
    }

    pub fn logical_size(&self) -> u64 {
        self.size.logical()
    }

    pub fn physical_size(&self) -> u64 {
        self.size.physical()
    }

    pub fn remote_client(&self) -> Option<&Arc<RemoteTimelineClient>> {
        self.remote.as_ref()
    }

    /// Apply a batch of deltas at `lsn`
    ///
    /// The batch is admitted by the quota, appended to the WAL and then
    /// inserted into the open layer. On any error nothing of it is applied.
    /// Once applied the batch is acknowledged; a failed checkpoint that
    /// follows is logged and left to the next checkpoint.
    pub fn ingest(&self, lsn: Lsn, deltas: &[Delta]) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PageStoreError::Cancelled);
        }
        if let Some(key) = deltas.iter().filter_map(Delta::key).find(|k| !(Key::MIN..Key::MAX).contains(k)) {
            return Err(PageStoreError::InvalidFormat(format!("key {} is reserved", key)));
        }
        {
            let _write = self.write_lock.lock();
            let last_record_lsn = self.last_record_lsn();
            if lsn <= last_record_lsn {
                return Err(PageStoreError::OutOfOrderLsn { lsn, last_record_lsn });
            }

            let records = self.size.apply_with(lsn, deltas, Some(&self.quota), || {
                self.wal.append(&WalEntry::ingest(lsn, deltas)?)
            })?;

            let open = self.layers.write().get_or_create_open(last_record_lsn.next());
            open.put_batch(records);
            self.last_record_lsn.send_replace(lsn);
        }
        if let Err(e) = self.maybe_checkpoint() {
            warn!(
                tenant_id = %self.tenant_id,
                timeline_id = %self.timeline_id,
                "Checkpoint after ingest at {} failed: {}",
                lsn,
                e
            );
        }
        Ok(())
    }

    /// Move `last_record_lsn` forward without data, e.g. past WAL records
    /// that carry no page content
    pub fn advance_flush_lsn(&self, lsn: Lsn) {
        let _write = self.write_lock.lock();
        self.last_record_lsn.send_if_modified(|current| {
            if lsn > *current {
                *current = lsn;
                true
            } else {
                false
            }
        });
    }

    /// Value of `key` at `lsn`
    pub fn get(&self, key: Key, lsn: Lsn) -> Result<Option<Bytes>> {
        let cutoff = self.latest_gc_cutoff_lsn();
        if lsn < cutoff {
            return Err(PageStoreError::LsnBelowGcCutoff { requested: lsn, cutoff });
        }
        Ok(self.state_at(&(key..key.next()), lsn)?.remove(&key))
    }

    /// Live keys in `keys` at `lsn`, following the ancestor chain
    pub(crate) fn state_at(&self, keys: &Range<Key>, lsn: Lsn) -> Result<BTreeMap<Key, Bytes>> {
        let snapshot = self.layers.read().snapshot();
        materialize(&snapshot, self.ancestor.as_ref(), self.ancestor_lsn, keys, lsn)
    }

    /// Logical size at `last_record_lsn` recomputed from the layers
    pub fn logical_size_non_incremental(&self) -> Result<u64> {
        self.logical_size_at(self.last_record_lsn())
    }

    fn logical_size_at(&self, lsn: Lsn) -> Result<u64> {
        Ok(self
            .state_at(&(Key::MIN..Key::MAX), lsn)?
            .values()
            .map(|v| v.len() as u64)
            .sum())
    }

    /// Sum of layer files in the timeline directory
    pub fn physical_size_non_incremental(&self) -> Result<u64> {
        size::physical_non_incremental(&self.dir)
    }

    /// Compare incremental counters with recomputed ones
    ///
    /// The logical check runs against a consistent (lsn, size) pair taken
    /// under the write lock. The physical check is skipped while uploads
    /// hold removed layer files open.
    pub fn verify_sizes(&self) -> Result<()> {
        let (lsn, logical) = {
            let _write = self.write_lock.lock();
            (self.last_record_lsn(), self.size.logical())
        };
        size::check_drift("logical", logical, self.logical_size_at(lsn)?)?;

        let _removal = self.layer_removal_cs.lock();
        let _flush = self.flush_lock.lock();
        if self.remote.as_ref().map_or(0, |r| r.queue_len()) == 0 {
            size::check_drift("physical", self.size.physical(), self.physical_size_non_incremental()?)?;
        }
        Ok(())
    }

    /// Wait until `last_record_lsn` reaches `lsn`
    pub async fn wait_for_last_record_lsn(&self, lsn: Lsn, timeout: Duration) -> Result<()> {
        let mut rx = self.last_record_lsn.subscribe();
        let res = tokio::time::timeout(timeout, rx.wait_for(|current| *current >= lsn))
            .await
            .map(|r| r.map(|_| ()));
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PageStoreError::Cancelled),
            Err(_) => Err(PageStoreError::Timeout {
                what: format!("last_record_lsn {} to reach {} on timeline {}", self.last_record_lsn(), lsn, self.timeline_id),
                timeout,
            }),
        }
    }

    /// Wait until `remote_consistent_lsn` reaches `lsn`
    pub async fn wait_for_upload(&self, lsn: Lsn, timeout: Duration) -> Result<()> {
        match &self.remote {
            Some(remote) => remote.wait_for_upload(lsn, timeout).await,
            None => Err(PageStoreError::Config("remote storage is not configured".into())),
        }
    }

    pub fn detail(&self, include_non_incremental: bool) -> Result<TimelineDetail> {
        let (layer_count, in_memory_layer_count) = {
            let layers = self.layers.read();
            (
                layers.historic().len(),
                layers.frozen_count() + usize::from(layers.open_layer().is_some()),
            )
        };
        let (logical_non_inc, physical_non_inc) = if include_non_incremental {
            (
                Some(self.logical_size_non_incremental()?),
                Some(self.physical_size_non_incremental()?),
            )
        } else {
            (None, None)
        };

        Ok(TimelineDetail {
            tenant_id: self.tenant_id,
            timeline_id: self.timeline_id,
            ancestor_timeline_id: self.ancestor_timeline_id(),
            ancestor_lsn: self.ancestor.as_ref().map(|_| self.ancestor_lsn),
            last_record_lsn: self.last_record_lsn(),
            disk_consistent_lsn: self.disk_consistent_lsn(),
            remote_consistent_lsn: self.remote_consistent_lsn(),
            latest_gc_cutoff_lsn: self.latest_gc_cutoff_lsn(),
            current_logical_size: self.size.logical(),
            current_logical_size_non_incremental: logical_non_inc,
            current_physical_size: self.size.physical(),
            current_physical_size_non_incremental: physical_non_inc,
            layer_count,
            in_memory_layer_count,
            upload_queue_len: self.remote.as_ref().map_or(0, |r| r.queue_len()),
            created_at: self.created_at,
        })
    }

    /// Fields every uploaded manifest carries
    pub(crate) fn index(&self) -> TimelineIndex {
        TimelineIndex {
            disk_consistent_lsn: self.disk_consistent_lsn(),
            ancestor_timeline: self.ancestor_timeline_id(),
            ancestor_lsn: self.ancestor_lsn,
        }
    }

    /// Rewrite the metadata file from the current in-memory state
    pub(crate) fn save_metadata(&self) -> Result<()> {
        let _guard = self.metadata_lock.lock();
        let (layers, disk_consistent_lsn) = {
            let layers = self.layers.read();
            (layers.historic_names(), self.disk_consistent_lsn())
        };
        let metadata = TimelineMetadata {
            format_version: super::METADATA_FORMAT_VERSION,
            disk_consistent_lsn,
            ancestor_timeline: self.ancestor_timeline_id(),
            ancestor_lsn: self.ancestor_lsn,
            latest_gc_cutoff_lsn: self.latest_gc_cutoff_lsn(),
            created_at: self.created_at,
            layers: layers.into_iter().collect(),
        };
        metadata.save(&self.dir)
    }

    /// Stop background work for this timeline; uploads are abandoned
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(remote) = &self.remote {
            remote.shutdown();
        }
        if let Err(e) = self.wal.sync() {
            warn!(timeline_id = %self.timeline_id, "Failed to sync WAL on shutdown: {}", e);
        }
    }
}

impl std::fmt::Debug for Timeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timeline")
            .field("tenant_id", &self.tenant_id)
            .field("timeline_id", &self.timeline_id)
            .field("last_record_lsn", &self.last_record_lsn())
            .field("disk_consistent_lsn", &self.disk_consistent_lsn())
            .finish()
    }
}

fn wal_config(timeline_dir: &Path, settings: &WalSettings) -> WalConfig {
    WalConfig {
        dir: timeline_dir.join("wal"),
        sync_policy: settings.sync_policy,
        segment_size: settings.segment_size,
    }
}

/// Open every layer the metadata lists, deleting unlisted leftovers
fn open_listed_layers(dir: &Path, metadata: &TimelineMetadata) -> Result<Vec<PersistentLayer>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if crashsafe::is_temp_file(&path) {
            debug!("Removing temporary file {:?}", path);
            std::fs::remove_file(&path)?;
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == METADATA_FILE_NAME || LayerName::parse(name).is_none() {
            continue;
        }
        if metadata.layers.contains(name) {
            found.push(path);
        } else {
            info!("Removing layer file {:?} not referenced by metadata", path);
            std::fs::remove_file(&path)?;
        }
    }

    if found.len() != metadata.layers.len() {
        let missing: Vec<_> = metadata
            .layers
            .iter()
            .filter(|name| !found.iter().any(|p| p.file_name().and_then(|n| n.to_str()) == Some(name.as_str())))
            .cloned()
            .collect();
        return Err(PageStoreError::corrupt(
            dir,
            format!("layer files listed in metadata are missing: {}", missing.join(", ")),
        ));
    }

    let mut layers = Vec::with_capacity(found.len());
    for path in found {
        let layer = PersistentLayer::open(path)?;
        if let Err(e) = layer.verify() {
            error!("Layer {} failed its integrity check: {}", layer.file_name(), e);
            return Err(e);
        }
        layers.push(layer);
    }
    Ok(layers)
}

/// Live state of `keys` at `lsn` from a snapshot, falling back to the
/// ancestor at the branch point for keys the snapshot does not resolve
fn materialize(
    snapshot: &LayerSnapshot,
    ancestor: Option<&Arc<Timeline>>,
    ancestor_lsn: Lsn,
    keys: &Range<Key>,
    lsn: Lsn,
) -> Result<BTreeMap<Key, Bytes>> {
    let own = snapshot.reconstruct(keys, lsn)?;
    let mut state = BTreeMap::new();
    if let Some(ancestor) = ancestor {
        for (key, value) in ancestor.state_at(keys, lsn.min(ancestor_lsn))? {
            if !own.resolves(&key) {
                state.insert(key, value);
            }
        }
    }
    for (key, value) in own.entries {
        if let Value::Put(bytes) = value {
            state.insert(key, bytes);
        }
    }
    Ok(state)
}
