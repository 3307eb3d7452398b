//! Tenant - the isolation unit owning a set of timelines

use super::timeline::{Timeline, TimelineResources};
use super::{tasks, TenantConf, TimelineMetadata, WalSettings};
use crate::compaction::{GcResult, GcTarget};
use crate::crashsafe;
use crate::quota::QuotaGuard;
use crate::remote::{RemoteStorage, UploadConfig};
use crate::{Lsn, PageStoreError, Result, TenantId, TimelineId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub(crate) const TENANT_CONF_FILE_NAME: &str = "tenant.json";
const TIMELINES_DIR: &str = "timelines";

/// A tenant and its timelines
pub struct Tenant {
    id: TenantId,
    dir: PathBuf,
    pub(crate) conf: TenantConf,
    wal: WalSettings,
    remote: Option<(Arc<dyn RemoteStorage>, UploadConfig)>,
    quota: Arc<QuotaGuard>,
    timelines: RwLock<HashMap<TimelineId, Arc<Timeline>>>,
    /// Held while GC runs and while branches are created, so a new branch
    /// point is never missed by a concurrent GC pass
    gc_cs: Mutex<()>,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Aggregate view of a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStatus {
    pub tenant_id: TenantId,
    pub timeline_count: usize,
    /// Sum of the incremental physical sizes of all timelines
    pub current_physical_size: u64,
    pub current_logical_size: u64,
    pub conf: TenantConf,
}

impl Tenant {
    /// Create the tenant directory and persist its configuration
    pub(crate) fn create(
        id: TenantId,
        dir: PathBuf,
        conf: TenantConf,
        wal: WalSettings,
        remote: Option<(Arc<dyn RemoteStorage>, UploadConfig)>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        if dir.exists() {
            return Err(PageStoreError::AlreadyExists(format!("tenant {}", id)));
        }
        crashsafe::create_dir_durable(&dir.join(TIMELINES_DIR))?;
        let json = serde_json::to_vec_pretty(&conf)
            .map_err(|e| PageStoreError::Internal(format!("tenant conf: {}", e)))?;
        crashsafe::write_atomic(&dir.join(TENANT_CONF_FILE_NAME), &json)?;

        info!(tenant_id = %id, "Created tenant");
        Ok(Arc::new(Self::new(id, dir, conf, wal, remote, cancel)))
    }

    /// Load a tenant directory and every timeline in it
    ///
    /// Timelines are loaded ancestors first. A timeline that fails to load is
    /// skipped along with its descendants.
    pub(crate) async fn load(
        id: TenantId,
        dir: PathBuf,
        default_conf: &TenantConf,
        wal: WalSettings,
        remote: Option<(Arc<dyn RemoteStorage>, UploadConfig)>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let conf = read_conf(&dir)?.unwrap_or_else(|| default_conf.clone());
        let tenant = Arc::new(Self::new(id, dir, conf, wal, remote, cancel));

        let mut pending: Vec<(TimelineId, Option<TimelineId>)> = Vec::new();
        for (timeline_id, path) in list_timeline_dirs(&tenant.timelines_dir())? {
            match TimelineMetadata::load(&path) {
                Ok(metadata) => pending.push((timeline_id, metadata.ancestor_timeline)),
                Err(e) => error!(tenant_id = %id, timeline_id = %timeline_id, "Failed to read timeline metadata: {}", e),
            }
        }

        let mut failed: HashSet<TimelineId> = HashSet::new();
        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for (timeline_id, ancestor_id) in pending {
                let ancestor = match ancestor_id {
                    None => None,
                    Some(ancestor_id) if failed.contains(&ancestor_id) => {
                        warn!(tenant_id = %id, timeline_id = %timeline_id, "Skipping timeline: ancestor {} failed to load", ancestor_id);
                        failed.insert(timeline_id);
                        continue;
                    }
                    Some(ancestor_id) => match tenant.timelines.read().get(&ancestor_id).cloned() {
                        Some(ancestor) => Some(ancestor),
                        None => {
                            deferred.push((timeline_id, Some(ancestor_id)));
                            continue;
                        }
                    },
                };

                let loaded = Timeline::load(id, timeline_id, tenant.timeline_dir(timeline_id), ancestor, tenant.resources());
                match loaded {
                    Ok(timeline) => {
                        if let Err(e) = timeline.init_remote().await {
                            warn!(tenant_id = %id, timeline_id = %timeline_id, "Failed to reconcile with remote storage: {}", e);
                        }
                        tenant.timelines.write().insert(timeline_id, timeline);
                    }
                    Err(e) => {
                        error!(tenant_id = %id, timeline_id = %timeline_id, "Failed to load timeline: {}", e);
                        failed.insert(timeline_id);
                    }
                }
            }
            if deferred.len() == before {
                for (timeline_id, ancestor_id) in &deferred {
                    error!(tenant_id = %id, timeline_id = %timeline_id, "Ancestor {:?} not found, skipping timeline", ancestor_id);
                }
                break;
            }
            pending = deferred;
        }

        info!(tenant_id = %id, "Loaded tenant with {} timelines", tenant.timeline_count());
        Ok(tenant)
    }

    fn new(
        id: TenantId,
        dir: PathBuf,
        conf: TenantConf,
        wal: WalSettings,
        remote: Option<(Arc<dyn RemoteStorage>, UploadConfig)>,
        cancel: CancellationToken,
    ) -> Self {
        let quota = Arc::new(QuotaGuard::new(conf.max_logical_size, conf.quota_scope));
        Self {
            id,
            dir,
            conf,
            wal,
            remote,
            quota,
            timelines: RwLock::new(HashMap::new()),
            gc_cs: Mutex::new(()),
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn resources(&self) -> TimelineResources {
        TimelineResources {
            conf: self.conf.clone(),
            wal: self.wal.clone(),
            quota: Arc::clone(&self.quota),
            remote: self.remote.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    fn timelines_dir(&self) -> PathBuf {
        self.dir.join(TIMELINES_DIR)
    }

    fn timeline_dir(&self, timeline_id: TimelineId) -> PathBuf {
        self.timelines_dir().join(timeline_id.to_string())
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conf(&self) -> &TenantConf {
        &self.conf
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.quota
    }

    pub fn get_timeline(&self, timeline_id: TimelineId) -> Result<Arc<Timeline>> {
        self.timelines
            .read()
            .get(&timeline_id)
            .cloned()
            .ok_or(PageStoreError::TimelineNotFound(timeline_id))
    }

    /// Timelines ordered by id
    pub fn list_timelines(&self) -> Vec<Arc<Timeline>> {
        let mut timelines: Vec<_> = self.timelines.read().values().cloned().collect();
        timelines.sort_by_key(|t| t.timeline_id());
        timelines
    }

    pub fn timeline_count(&self) -> usize {
        self.timelines.read().len()
    }

    /// Create a timeline, branched from `ancestor` if given
    ///
    /// The branch LSN defaults to the ancestor's `last_record_lsn` and must
    /// lie between the ancestor's GC cutoff and its `last_record_lsn`.
    pub fn create_timeline(
        &self,
        timeline_id: TimelineId,
        ancestor: Option<(TimelineId, Option<Lsn>)>,
    ) -> Result<Arc<Timeline>> {
        if self.cancel.is_cancelled() {
            return Err(PageStoreError::Cancelled);
        }
        let _gc = self.gc_cs.lock();
        if self.timelines.read().contains_key(&timeline_id) {
            return Err(PageStoreError::AlreadyExists(format!("timeline {}", timeline_id)));
        }

        let ancestor = match ancestor {
            Some((ancestor_id, start_lsn)) => {
                let ancestor = self.get_timeline(ancestor_id)?;
                let last_record_lsn = ancestor.last_record_lsn();
                let lsn = start_lsn.unwrap_or(last_record_lsn);
                let cutoff = ancestor.latest_gc_cutoff_lsn();
                if lsn < cutoff {
                    return Err(PageStoreError::InvalidBranch(format!(
                        "start LSN {} is below the GC cutoff {} of timeline {}",
                        lsn, cutoff, ancestor_id
                    )));
                }
                if lsn > last_record_lsn {
                    return Err(PageStoreError::InvalidBranch(format!(
                        "start LSN {} is ahead of last record LSN {} of timeline {}",
                        lsn, last_record_lsn, ancestor_id
                    )));
                }
                Some((ancestor, lsn))
            }
            None => None,
        };

        let timeline = Timeline::create(
            self.id,
            timeline_id,
            self.timeline_dir(timeline_id),
            ancestor,
            self.resources(),
        )?;
        self.timelines.write().insert(timeline_id, Arc::clone(&timeline));
        Ok(timeline)
    }

    /// Delete a timeline with its local files and remote objects
    ///
    /// Refused while other timelines branch from it.
    pub async fn delete_timeline(&self, timeline_id: TimelineId) -> Result<()> {
        let timeline = {
            let mut timelines = self.timelines.write();
            let timeline = timelines
                .get(&timeline_id)
                .cloned()
                .ok_or(PageStoreError::TimelineNotFound(timeline_id))?;
            let children: Vec<String> = timelines
                .values()
                .filter(|t| t.ancestor_timeline_id() == Some(timeline_id))
                .map(|t| t.timeline_id().to_string())
                .collect();
            if !children.is_empty() {
                return Err(PageStoreError::InvalidBranch(format!(
                    "timeline {} has child timelines: {}",
                    timeline_id,
                    children.join(", ")
                )));
            }
            timelines.remove(&timeline_id);
            timeline
        };

        timeline.shutdown();
        if let Some(remote) = timeline.remote_client() {
            match remote.delete_all().await {
                Ok(count) => info!(timeline_id = %timeline_id, "Deleted {} remote objects", count),
                Err(e) => warn!(timeline_id = %timeline_id, "Failed to delete remote objects: {}", e),
            }
        }

        // running compaction or GC finish before the files go away
        let dir = timeline.dir().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let _removal = timeline.layer_removal_cs.lock();
            let _flush = timeline.flush_lock.lock();
            std::fs::remove_dir_all(&dir)?;
            Ok(())
        })
        .await
        .map_err(|e| PageStoreError::Internal(e.to_string()))??;

        info!(tenant_id = %self.id, timeline_id = %timeline_id, "Deleted timeline");
        Ok(())
    }

    /// GC every timeline, or just `target_timeline`
    ///
    /// Branch points are collected under the same lock that guards branch
    /// creation.
    pub fn gc_iteration(
        &self,
        target_timeline: Option<TimelineId>,
        target: GcTarget,
        on_demand: bool,
    ) -> Result<GcResult> {
        let _gc = self.gc_cs.lock();
        let timelines = self.list_timelines();
        if let Some(id) = target_timeline {
            if !timelines.iter().any(|t| t.timeline_id() == id) {
                return Err(PageStoreError::TimelineNotFound(id));
            }
        }

        let mut branch_points: HashMap<TimelineId, Vec<Lsn>> = HashMap::new();
        for timeline in &timelines {
            if let Some(ancestor_id) = timeline.ancestor_timeline_id() {
                branch_points
                    .entry(ancestor_id)
                    .or_default()
                    .push(timeline.ancestor_lsn());
            }
        }

        let mut total = GcResult::default();
        for timeline in timelines {
            if target_timeline.map_or(false, |id| id != timeline.timeline_id()) {
                continue;
            }
            let points = branch_points
                .get(&timeline.timeline_id())
                .map_or(&[][..], Vec::as_slice);
            match timeline.gc(target, points, on_demand) {
                Ok(result) => total += result,
                Err(e) if target_timeline.is_some() => return Err(e),
                Err(PageStoreError::Cancelled) => {}
                Err(e) => warn!(timeline_id = %timeline.timeline_id(), "GC failed: {}", e),
            }
        }
        Ok(total)
    }

    pub(crate) fn compaction_iteration(&self) -> Result<()> {
        for timeline in self.list_timelines() {
            match timeline.compact(false) {
                Ok(_) | Err(PageStoreError::Cancelled) => {}
                Err(e) => warn!(timeline_id = %timeline.timeline_id(), "Compaction failed: {}", e),
            }
        }
        Ok(())
    }

    pub(crate) fn checkpoint_iteration(&self) -> Result<()> {
        for timeline in self.list_timelines() {
            if let Err(e) = timeline.checkpoint_if_stale() {
                warn!(timeline_id = %timeline.timeline_id(), "Timeout checkpoint failed: {}", e);
            }
        }
        Ok(())
    }

    /// Compare incremental and recomputed sizes of every timeline
    ///
    /// Drift is logged, never corrected.
    pub(crate) fn reconcile_sizes(&self) -> Result<()> {
        for timeline in self.list_timelines() {
            match timeline.verify_sizes() {
                Ok(()) => {}
                Err(e @ PageStoreError::SizeDrift { .. }) => {
                    error!(tenant_id = %self.id, timeline_id = %timeline.timeline_id(), "{}", e)
                }
                Err(e) => warn!(timeline_id = %timeline.timeline_id(), "Size reconciliation failed: {}", e),
            }
        }
        Ok(())
    }

    pub fn status(&self) -> TenantStatus {
        let timelines = self.list_timelines();
        TenantStatus {
            tenant_id: self.id,
            timeline_count: timelines.len(),
            current_physical_size: timelines.iter().map(|t| t.physical_size()).sum(),
            current_logical_size: timelines.iter().map(|t| t.logical_size()).sum(),
            conf: self.conf.clone(),
        }
    }

    /// Start the periodic compaction, GC, checkpoint and size loops
    pub(crate) fn start_background_loops(self: &Arc<Self>) {
        tasks::spawn_background_loops(self);
    }

    /// Stop background loops and every timeline
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(tenant_id = %self.id, "Background task ended abnormally: {}", e);
            }
        }
        for timeline in self.list_timelines() {
            timeline.shutdown();
        }
        info!(tenant_id = %self.id, "Tenant shut down");
    }
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("timelines", &self.timeline_count())
            .finish()
    }
}

fn read_conf(dir: &Path) -> Result<Option<TenantConf>> {
    let path = dir.join(TENANT_CONF_FILE_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(&path)?;
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| PageStoreError::InvalidFormat(format!("{:?}: {}", path, e)))
}

fn list_timeline_dirs(dir: &Path) -> Result<Vec<(TimelineId, PathBuf)>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        match name.parse::<TimelineId>() {
            Ok(id) => found.push((id, entry.path())),
            Err(_) => warn!("Ignoring unexpected directory {:?}", entry.path()),
        }
    }
    Ok(found)
}
