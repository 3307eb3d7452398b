//! Per-timeline upload queue
//!
//! Operations are executed in the order they were scheduled, with one
//! relaxation: consecutive layer uploads run in parallel (bounded by the
//! configured concurrency). Manifest uploads and remote deletions are
//! barriers: they start only when nothing else is in flight, and nothing
//! scheduled after them starts before they finish. Together this keeps the
//! remote state a consistent prefix of the local one.
//!
//! Failed operations are retried with exponential backoff until they
//! succeed or the timeline shuts down. `remote_consistent_lsn` moves
//! forward only when a manifest upload completes.

use super::{RemotePath, RemoteStorage, UploadManifest};
use crate::layer::{LayerName, PersistentLayer};
use crate::{Lsn, PageStoreError, Result, TenantId, TimelineId};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upload queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Maximum layer uploads in flight per timeline
    pub concurrency: usize,
    #[serde(with = "crate::types::duration_format")]
    pub initial_backoff: Duration,
    #[serde(with = "crate::types::duration_format")]
    pub max_backoff: Duration,
    /// Consecutive failures after which durability is reported degraded
    pub warn_after_attempts: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            warn_after_attempts: 5,
        }
    }
}

/// Timeline fields carried by every manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineIndex {
    pub disk_consistent_lsn: Lsn,
    pub ancestor_timeline: Option<TimelineId>,
    pub ancestor_lsn: Lsn,
}

/// One queued remote operation
pub enum UploadOp {
    UploadLayer(Arc<PersistentLayer>),
    UploadManifest(UploadManifest),
    DeleteLayers(Vec<String>),
}

impl UploadOp {
    fn is_barrier(&self) -> bool {
        !matches!(self, UploadOp::UploadLayer(_))
    }

    fn describe(&self) -> String {
        match self {
            UploadOp::UploadLayer(layer) => format!("upload layer {}", layer.file_name()),
            UploadOp::UploadManifest(m) => format!(
                "upload index_part generation {} at {}",
                m.generation, m.disk_consistent_lsn
            ),
            UploadOp::DeleteLayers(names) => format!("delete {} remote layers", names.len()),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<UploadOp>,
    inprogress_layers: usize,
    inprogress_barrier: bool,
    /// Remote layer set once everything queued has completed
    projected_layers: BTreeMap<String, u64>,
    /// Last manifest scheduled
    latest_manifest: Option<UploadManifest>,
    /// Last manifest known to be stored remotely
    uploaded_manifest: Option<UploadManifest>,
    generation: u64,
    ops_completed: u64,
    stopped: bool,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.queued.len() + self.inprogress_layers + usize::from(self.inprogress_barrier)
    }
}

/// Replicates one timeline's layers and manifest to remote storage
pub struct RemoteTimelineClient {
    tenant_id: TenantId,
    timeline_id: TimelineId,
    storage: Arc<dyn RemoteStorage>,
    config: UploadConfig,
    runtime: Handle,
    state: Mutex<QueueState>,
    permits: Arc<Semaphore>,
    remote_consistent_lsn: watch::Sender<Lsn>,
    pending: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl RemoteTimelineClient {
    /// Must be called from within a tokio runtime
    pub fn new(
        tenant_id: TenantId,
        timeline_id: TimelineId,
        storage: Arc<dyn RemoteStorage>,
        config: UploadConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current()
            .map_err(|e| PageStoreError::Internal(format!("remote client needs a runtime: {}", e)))?;
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Ok(Arc::new(Self {
            tenant_id,
            timeline_id,
            storage,
            config,
            runtime,
            state: Mutex::new(QueueState::default()),
            permits,
            remote_consistent_lsn: watch::channel(Lsn::INVALID).0,
            pending: watch::channel(0).0,
            cancel,
        }))
    }

    pub fn remote_consistent_lsn(&self) -> Lsn {
        *self.remote_consistent_lsn.borrow()
    }

    /// Operations queued or in flight
    pub fn queue_len(&self) -> usize {
        self.state.lock().pending()
    }

    pub fn ops_completed(&self) -> u64 {
        self.state.lock().ops_completed
    }

    /// Bytes of layers referenced by the last uploaded manifest
    pub fn remote_physical_size(&self) -> u64 {
        self.state
            .lock()
            .uploaded_manifest
            .as_ref()
            .map_or(0, |m| m.total_size())
    }

    /// Layer names the remote side will hold once the queue drains
    pub fn projected_layers(&self) -> BTreeMap<String, u64> {
        self.state.lock().projected_layers.clone()
    }

    /// Queue a layer upload; a layer already uploaded or queued is skipped
    pub fn schedule_layer_upload(self: &Arc<Self>, layer: Arc<PersistentLayer>) {
        let mut st = self.state.lock();
        if st.stopped {
            return;
        }
        if st.projected_layers.get(layer.file_name()) == Some(&layer.file_size()) {
            debug!("Layer {} already scheduled for upload", layer.file_name());
            return;
        }
        st.projected_layers
            .insert(layer.file_name().to_string(), layer.file_size());
        st.queued.push_back(UploadOp::UploadLayer(layer));
        self.launch_queued(&mut st);
    }

    /// Queue a manifest upload describing the projected layer set
    pub fn schedule_manifest_upload(self: &Arc<Self>, index: TimelineIndex) {
        let mut st = self.state.lock();
        self.schedule_manifest_locked(&mut st, index);
        self.launch_queued(&mut st);
    }

    /// Drop layers from the projected set, publish a manifest without them,
    /// then delete them remotely
    pub fn schedule_layer_removal(self: &Arc<Self>, names: Vec<String>, index: TimelineIndex) {
        if names.is_empty() {
            return;
        }
        let mut st = self.state.lock();
        for name in &names {
            st.projected_layers.remove(name);
        }
        self.schedule_manifest_locked(&mut st, index);
        if !st.stopped {
            st.queued.push_back(UploadOp::DeleteLayers(names));
        }
        self.launch_queued(&mut st);
    }

    fn schedule_manifest_locked(&self, st: &mut QueueState, index: TimelineIndex) {
        if st.stopped {
            return;
        }
        let mut manifest = UploadManifest::new(
            index.disk_consistent_lsn,
            index.ancestor_timeline,
            index.ancestor_lsn,
            st.projected_layers.clone(),
        );
        if let Some(latest) = &st.latest_manifest {
            if latest.same_content(&manifest) {
                return;
            }
        }
        st.generation += 1;
        manifest.generation = st.generation;
        st.latest_manifest = Some(manifest.clone());
        st.queued.push_back(UploadOp::UploadManifest(manifest));
    }

    fn launch_queued(self: &Arc<Self>, st: &mut QueueState) {
        while !st.stopped && !st.inprogress_barrier {
            let barrier = match st.queued.front() {
                Some(op) => op.is_barrier(),
                None => break,
            };
            if barrier {
                if st.inprogress_layers > 0 {
                    break;
                }
                st.inprogress_barrier = true;
            } else {
                st.inprogress_layers += 1;
            }
            let Some(op) = st.queued.pop_front() else { break };
            let this = Arc::clone(self);
            self.runtime.spawn(async move { this.run_op(op).await });
        }
        self.pending.send_replace(st.pending());
    }

    async fn run_op(self: Arc<Self>, op: UploadOp) {
        let permit = if op.is_barrier() {
            None
        } else {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                permit = self.permits.clone().acquire_owned() => permit.ok(),
            }
        };

        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                debug!("Upload queue stopped, abandoning {}", op.describe());
                return;
            }
            match self.perform(&op).await {
                Ok(()) => break,
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.warn_after_attempts {
                        warn!(
                            tenant_id = %self.tenant_id,
                            timeline_id = %self.timeline_id,
                            attempts,
                            "Remote durability degraded: {} keeps failing: {}",
                            op.describe(),
                            e
                        );
                    } else {
                        info!(
                            tenant_id = %self.tenant_id,
                            timeline_id = %self.timeline_id,
                            attempts,
                            "Failed to {}, will retry: {}",
                            op.describe(),
                            e
                        );
                    }
                    let delay = backoff_delay(attempts, &self.config);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        drop(permit);

        let mut st = self.state.lock();
        match &op {
            UploadOp::UploadLayer(_) => st.inprogress_layers -= 1,
            UploadOp::UploadManifest(manifest) => {
                st.inprogress_barrier = false;
                let lsn = manifest.disk_consistent_lsn;
                st.uploaded_manifest = Some(manifest.clone());
                self.remote_consistent_lsn.send_if_modified(|current| {
                    if lsn > *current {
                        *current = lsn;
                        true
                    } else {
                        false
                    }
                });
            }
            UploadOp::DeleteLayers(_) => st.inprogress_barrier = false,
        }
        st.ops_completed += 1;
        debug!("Completed {}", op.describe());
        self.launch_queued(&mut st);
    }

    async fn perform(&self, op: &UploadOp) -> Result<()> {
        let storage = Arc::clone(&self.storage);
        let (tenant_id, timeline_id) = (self.tenant_id, self.timeline_id);
        let task = match op {
            UploadOp::UploadLayer(layer) => {
                let layer = Arc::clone(layer);
                tokio::task::spawn_blocking(move || {
                    let data = layer.read_bytes()?;
                    storage.put(
                        &RemotePath::layer(tenant_id, timeline_id, layer.file_name()),
                        Bytes::from(data),
                    )
                })
            }
            UploadOp::UploadManifest(manifest) => {
                let data = manifest.to_bytes()?;
                tokio::task::spawn_blocking(move || {
                    storage.put(&RemotePath::index_part(tenant_id, timeline_id), data)
                })
            }
            UploadOp::DeleteLayers(names) => {
                let names = names.clone();
                tokio::task::spawn_blocking(move || {
                    for name in &names {
                        storage.delete(&RemotePath::layer(tenant_id, timeline_id, name))?;
                    }
                    Ok(())
                })
            }
        };
        task.await
            .map_err(|e| PageStoreError::Internal(format!("upload task panicked: {}", e)))?
    }

    /// Resume replication after a restart
    ///
    /// Layers missing remotely are re-queued, a manifest matching the local
    /// state is published, and remote layers the local state no longer
    /// references are deleted.
    pub async fn init_from_remote(
        self: &Arc<Self>,
        local_layers: &[Arc<PersistentLayer>],
        index: TimelineIndex,
    ) -> Result<()> {
        let remote = match self.download_index().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(
                    tenant_id = %self.tenant_id,
                    timeline_id = %self.timeline_id,
                    "Could not download index_part.json, scheduling full upload: {}",
                    e
                );
                None
            }
        };
        let listed = match self.list_remote().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!("Could not list remote timeline objects: {}", e);
                Vec::new()
            }
        };

        let local: BTreeMap<&str, u64> = local_layers
            .iter()
            .map(|l| (l.file_name(), l.file_size()))
            .collect();

        let mut orphans: BTreeSet<String> = listed
            .iter()
            .map(|p| p.object_name().to_string())
            .filter(|name| LayerName::parse(name).is_some() && !local.contains_key(name.as_str()))
            .collect();

        {
            let mut st = self.state.lock();
            if let Some(remote) = &remote {
                st.projected_layers = remote
                    .layers
                    .iter()
                    .filter(|(name, size)| local.get(name.as_str()) == Some(*size))
                    .map(|(name, size)| (name.clone(), *size))
                    .collect();
                orphans.extend(
                    remote
                        .layers
                        .keys()
                        .filter(|name| !local.contains_key(name.as_str()))
                        .cloned(),
                );
                st.generation = remote.generation;
                st.latest_manifest = Some(remote.clone());
                st.uploaded_manifest = Some(remote.clone());
                let resumed = remote.disk_consistent_lsn.min(index.disk_consistent_lsn);
                self.remote_consistent_lsn.send_replace(resumed);
            }
        }

        let mut requeued = 0;
        for layer in local_layers {
            if self.state.lock().projected_layers.get(layer.file_name()) != Some(&layer.file_size()) {
                requeued += 1;
            }
            self.schedule_layer_upload(Arc::clone(layer));
        }
        self.schedule_manifest_upload(index);
        let orphans: Vec<String> = orphans.into_iter().collect();
        if !orphans.is_empty() {
            self.schedule_layer_removal(orphans.clone(), index);
        }

        info!(
            tenant_id = %self.tenant_id,
            timeline_id = %self.timeline_id,
            "Resumed remote replication: {} layers re-queued, {} remote orphans, remote_consistent_lsn {}",
            requeued,
            orphans.len(),
            self.remote_consistent_lsn()
        );
        Ok(())
    }

    async fn download_index(&self) -> Result<Option<UploadManifest>> {
        let storage = Arc::clone(&self.storage);
        let path = RemotePath::index_part(self.tenant_id, self.timeline_id);
        let data = self
            .with_bounded_retries("download index_part.json", move || storage.get(&path))
            .await?;
        data.map(|d| UploadManifest::from_bytes(&d)).transpose()
    }

    async fn list_remote(&self) -> Result<Vec<RemotePath>> {
        let storage = Arc::clone(&self.storage);
        let prefix = RemotePath::timeline_prefix(self.tenant_id, self.timeline_id);
        self.with_bounded_retries("list remote timeline", move || storage.list(&prefix))
            .await
    }

    async fn with_bounded_retries<T, F>(&self, what: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn() -> Result<T> + Send + Sync + Clone + 'static,
    {
        let mut attempts = 0;
        loop {
            let call = f.clone();
            let res = tokio::task::spawn_blocking(call)
                .await
                .map_err(|e| PageStoreError::Internal(e.to_string()))?;
            match res {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempts + 1 < self.config.warn_after_attempts => {
                    attempts += 1;
                    debug!("Failed to {} (attempt {}): {}", what, attempts, e);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(PageStoreError::Cancelled),
                        _ = tokio::time::sleep(backoff_delay(attempts, &self.config)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait until `remote_consistent_lsn` reaches `lsn`
    pub async fn wait_for_upload(&self, lsn: Lsn, timeout: Duration) -> Result<()> {
        let mut rx = self.remote_consistent_lsn.subscribe();
        let res = tokio::time::timeout(timeout, rx.wait_for(|current| *current >= lsn))
            .await
            .map(|r| r.map(|_| ()));
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PageStoreError::Cancelled),
            Err(_) => Err(PageStoreError::Timeout {
                what: format!(
                    "remote_consistent_lsn to reach {} on timeline {}",
                    lsn, self.timeline_id
                ),
                timeout,
            }),
        }
    }

    /// Wait until nothing is queued or in flight
    pub async fn wait_completion(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.pending.subscribe();
        let res = tokio::time::timeout(timeout, rx.wait_for(|pending| *pending == 0))
            .await
            .map(|r| r.map(|_| ()));
        match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PageStoreError::Cancelled),
            Err(_) => Err(PageStoreError::Timeout {
                what: format!("upload queue of timeline {} to drain", self.timeline_id),
                timeout,
            }),
        }
    }

    /// Stop the queue; queued and in-flight operations are abandoned
    pub fn shutdown(&self) {
        let mut st = self.state.lock();
        st.stopped = true;
        let dropped = st.queued.len();
        st.queued.clear();
        self.cancel.cancel();
        if dropped > 0 {
            info!(
                tenant_id = %self.tenant_id,
                timeline_id = %self.timeline_id,
                "Upload queue stopped with {} operations pending",
                dropped
            );
        }
    }

    /// Remove every remote object of the timeline (after shutdown)
    pub async fn delete_all(&self) -> Result<usize> {
        let storage = Arc::clone(&self.storage);
        let prefix = RemotePath::timeline_prefix(self.tenant_id, self.timeline_id);
        tokio::task::spawn_blocking(move || {
            let objects = storage.list(&prefix)?;
            // manifest first so a partial deletion never looks consistent
            let (index, layers): (Vec<_>, Vec<_>) = objects
                .into_iter()
                .partition(|p| p.object_name() == super::INDEX_PART_NAME);
            let count = index.len() + layers.len();
            for path in index.iter().chain(layers.iter()) {
                storage.delete(path)?;
            }
            Ok(count)
        })
        .await
        .map_err(|e| PageStoreError::Internal(e.to_string()))?
    }
}

/// Exponential backoff with jitter, capped at `max_backoff`
pub(crate) fn backoff_delay(attempt: u32, config: &UploadConfig) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let base = config
        .initial_backoff
        .saturating_mul(1u32 << exp)
        .min(config.max_backoff);
    let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
    base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerWriter;
    use crate::remote::InMemoryStorage;
    use crate::{Key, Record, Value};
    use tempfile::TempDir;

    fn fast_config() -> UploadConfig {
        UploadConfig {
            concurrency: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            warn_after_attempts: 3,
        }
    }

    fn write_layer(dir: &TempDir, start: u64, end: u64) -> Arc<PersistentLayer> {
        let mut writer =
            LayerWriter::new_delta(dir.path().to_path_buf(), Key::MIN..Key::MAX, Lsn(start)..Lsn(end));
        writer
            .add(&Record::new(Key::new(1, 1, 1), Lsn(start), Value::Put(Bytes::from_static(b"v"))))
            .unwrap();
        Arc::new(writer.finish().unwrap())
    }

    fn index(lsn: u64) -> TimelineIndex {
        TimelineIndex {
            disk_consistent_lsn: Lsn(lsn),
            ancestor_timeline: None,
            ancestor_lsn: Lsn::INVALID,
        }
    }

    fn client(storage: Arc<InMemoryStorage>) -> (Arc<RemoteTimelineClient>, TenantId, TimelineId) {
        let tenant = TenantId::generate();
        let timeline = TimelineId::generate();
        let client = RemoteTimelineClient::new(
            tenant,
            timeline,
            storage,
            fast_config(),
            CancellationToken::new(),
        )
        .unwrap();
        (client, tenant, timeline)
    }

    #[tokio::test]
    async fn test_manifest_after_layers() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let (client, tenant, timeline) = client(storage.clone());

        let a = write_layer(&dir, 1, 10);
        let b = write_layer(&dir, 10, 20);
        client.schedule_layer_upload(a.clone());
        client.schedule_layer_upload(b.clone());
        client.schedule_manifest_upload(index(19));

        client.wait_for_upload(Lsn(19), Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.remote_consistent_lsn(), Lsn(19));

        let data = storage.get(&RemotePath::index_part(tenant, timeline)).unwrap().unwrap();
        let manifest = UploadManifest::from_bytes(&data).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        for name in manifest.layers.keys() {
            assert!(storage.get(&RemotePath::layer(tenant, timeline, name)).unwrap().is_some());
        }
        assert_eq!(client.remote_physical_size(), a.file_size() + b.file_size());
    }

    #[tokio::test]
    async fn test_duplicate_schedules_are_skipped() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let (client, _, _) = client(storage.clone());

        let a = write_layer(&dir, 1, 10);
        client.schedule_layer_upload(a.clone());
        client.schedule_layer_upload(a.clone());
        client.schedule_manifest_upload(index(9));
        client.schedule_manifest_upload(index(9));
        client.wait_completion(Duration::from_secs(5)).await.unwrap();

        // one layer and one manifest
        assert_eq!(storage.put_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let (client, _, _) = client(storage.clone());

        storage.fail_next(4);
        client.schedule_layer_upload(write_layer(&dir, 1, 10));
        client.schedule_manifest_upload(index(9));

        client.wait_for_upload(Lsn(9), Duration::from_secs(5)).await.unwrap();
        assert_eq!(client.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let storage = Arc::new(InMemoryStorage::new());
        let (client, _, _) = client(storage);

        let err = client
            .wait_for_upload(Lsn(100), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PageStoreError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_removal_deletes_after_manifest() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let (client, tenant, timeline) = client(storage.clone());

        let a = write_layer(&dir, 1, 10);
        let b = write_layer(&dir, 10, 20);
        client.schedule_layer_upload(a.clone());
        client.schedule_layer_upload(b.clone());
        client.schedule_manifest_upload(index(19));
        client.schedule_layer_removal(vec![a.file_name().to_string()], index(19));
        client.wait_completion(Duration::from_secs(5)).await.unwrap();

        assert!(storage
            .get(&RemotePath::layer(tenant, timeline, a.file_name()))
            .unwrap()
            .is_none());
        let data = storage.get(&RemotePath::index_part(tenant, timeline)).unwrap().unwrap();
        let manifest = UploadManifest::from_bytes(&data).unwrap();
        assert_eq!(manifest.layers.keys().collect::<Vec<_>>(), vec![b.file_name()]);
    }

    #[tokio::test]
    async fn test_resume_requeues_missing_and_deletes_orphans() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(InMemoryStorage::new());
        let (first, tenant, timeline) = client(storage.clone());

        let a = write_layer(&dir, 1, 10);
        let stale = write_layer(&dir, 10, 20);
        first.schedule_layer_upload(a.clone());
        first.schedule_layer_upload(stale.clone());
        first.schedule_manifest_upload(index(19));
        first.wait_completion(Duration::from_secs(5)).await.unwrap();
        first.shutdown();

        // after restart: `stale` is gone locally, `c` was never uploaded
        let c = write_layer(&dir, 20, 30);
        let resumed = RemoteTimelineClient::new(
            tenant,
            timeline,
            storage.clone(),
            fast_config(),
            CancellationToken::new(),
        )
        .unwrap();
        resumed
            .init_from_remote(&[a.clone(), c.clone()], index(29))
            .await
            .unwrap();
        resumed.wait_for_upload(Lsn(29), Duration::from_secs(5)).await.unwrap();
        resumed.wait_completion(Duration::from_secs(5)).await.unwrap();

        let names: BTreeSet<String> = storage.keys().iter().map(|p| p.object_name().to_string()).collect();
        assert!(names.contains(a.file_name()));
        assert!(names.contains(c.file_name()));
        assert!(!names.contains(stale.file_name()));

        let data = storage.get(&RemotePath::index_part(tenant, timeline)).unwrap().unwrap();
        assert_eq!(UploadManifest::from_bytes(&data).unwrap().generation, 2);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = UploadConfig::default();
        assert!(backoff_delay(1, &config) <= Duration::from_millis(100));
        assert!(backoff_delay(1, &config) >= Duration::from_millis(50));
        assert!(backoff_delay(30, &config) <= Duration::from_secs(10));
    }
}
