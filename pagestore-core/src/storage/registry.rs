//! Tenant registry - top-level coordinator

use super::{StorageConfig, Tenant, TenantConf, Timeline};
use crate::command::{AdminCommand, CommandOutput};
use crate::compaction::GcTarget;
use crate::remote::{RemoteStorage, UploadConfig};
use crate::{crashsafe, Lsn, PageStoreError, Result, TenantId, TimelineId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TENANTS_DIR: &str = "tenants";

/// Timeline creation request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTimeline {
    /// Generated when absent
    #[serde(default)]
    pub new_timeline_id: Option<TimelineId>,
    #[serde(default)]
    pub ancestor_timeline_id: Option<TimelineId>,
    /// Defaults to the ancestor's last record LSN
    #[serde(default)]
    pub ancestor_start_lsn: Option<Lsn>,
}

/// Owns every tenant of the process
pub struct TenantRegistry {
    config: StorageConfig,
    remote: Option<Arc<dyn RemoteStorage>>,
    tenants: RwLock<HashMap<TenantId, Arc<Tenant>>>,
    cancel: CancellationToken,
}

impl TenantRegistry {
    /// Open the data directory and load every tenant in it
    pub async fn new(config: StorageConfig) -> Result<Arc<Self>> {
        crashsafe::create_dir_durable(&config.data_dir.join(TENANTS_DIR))?;
        let remote = config.remote_storage.as_ref().map(|c| c.build()).transpose()?;

        let registry = Arc::new(Self {
            config,
            remote,
            tenants: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        registry.load_tenants().await?;
        Ok(registry)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn tenant_dir(&self, tenant_id: TenantId) -> PathBuf {
        self.config.data_dir.join(TENANTS_DIR).join(tenant_id.to_string())
    }

    fn remote(&self) -> Option<(Arc<dyn RemoteStorage>, UploadConfig)> {
        self.remote
            .as_ref()
            .map(|storage| (Arc::clone(storage), self.config.upload.clone()))
    }

    /// Create a tenant; settings not given come from `default_tenant_conf`
    pub fn create_tenant(&self, tenant_id: Option<TenantId>, conf: Option<TenantConf>) -> Result<Arc<Tenant>> {
        let tenant_id = tenant_id.unwrap_or_else(TenantId::generate);
        let mut tenants = self.tenants.write();
        if tenants.contains_key(&tenant_id) {
            return Err(PageStoreError::AlreadyExists(format!("tenant {}", tenant_id)));
        }

        let tenant = Tenant::create(
            tenant_id,
            self.tenant_dir(tenant_id),
            conf.unwrap_or_else(|| self.config.default_tenant_conf.clone()),
            self.config.wal.clone(),
            self.remote(),
            self.cancel.child_token(),
        )?;
        if self.config.background_tasks {
            tenant.start_background_loops();
        }
        tenants.insert(tenant_id, Arc::clone(&tenant));
        Ok(tenant)
    }

    pub fn get_tenant(&self, tenant_id: TenantId) -> Result<Arc<Tenant>> {
        self.tenants
            .read()
            .get(&tenant_id)
            .cloned()
            .ok_or(PageStoreError::TenantNotFound(tenant_id))
    }

    /// Tenants ordered by id
    pub fn list_tenants(&self) -> Vec<Arc<Tenant>> {
        let mut tenants: Vec<_> = self.tenants.read().values().cloned().collect();
        tenants.sort_by_key(|t| t.id());
        tenants
    }

    pub fn get_timeline(&self, tenant_id: TenantId, timeline_id: TimelineId) -> Result<Arc<Timeline>> {
        self.get_tenant(tenant_id)?.get_timeline(timeline_id)
    }

    pub fn create_timeline(&self, tenant_id: TenantId, request: CreateTimeline) -> Result<Arc<Timeline>> {
        let tenant = self.get_tenant(tenant_id)?;
        let timeline_id = request.new_timeline_id.unwrap_or_else(TimelineId::generate);
        let ancestor = request
            .ancestor_timeline_id
            .map(|id| (id, request.ancestor_start_lsn));
        tenant.create_timeline(timeline_id, ancestor)
    }

    /// Delete a timeline; a tenant left without timelines is removed too
    pub async fn delete_timeline(&self, tenant_id: TenantId, timeline_id: TimelineId) -> Result<()> {
        let tenant = self.get_tenant(tenant_id)?;
        tenant.delete_timeline(timeline_id).await?;

        let emptied = {
            let mut tenants = self.tenants.write();
            if tenant.timeline_count() == 0 {
                tenants.remove(&tenant_id)
            } else {
                None
            }
        };
        if let Some(tenant) = emptied {
            tenant.shutdown().await;
            let dir = tenant.dir().to_path_buf();
            tokio::task::spawn_blocking(move || std::fs::remove_dir_all(dir))
                .await
                .map_err(|e| PageStoreError::Internal(e.to_string()))??;
            info!(tenant_id = %tenant_id, "Deleted tenant with its last timeline");
        }
        Ok(())
    }

    /// Run an admin command to completion
    pub async fn execute(&self, command: AdminCommand) -> Result<CommandOutput> {
        let (tenant_id, timeline_id) = command.target();
        let tenant = self.get_tenant(tenant_id)?;
        let timeline = tenant.get_timeline(timeline_id)?;

        let output = tokio::task::spawn_blocking(move || -> Result<CommandOutput> {
            match command {
                AdminCommand::Checkpoint { .. } => {
                    timeline.checkpoint(true)?;
                    Ok(CommandOutput::Done)
                }
                AdminCommand::Compact { .. } => {
                    timeline.compact(true)?;
                    Ok(CommandOutput::Done)
                }
                AdminCommand::DoGc { pitr, .. } => {
                    let result = tenant.gc_iteration(Some(timeline_id), GcTarget::Pitr(pitr), true)?;
                    Ok(CommandOutput::Gc(result))
                }
            }
        })
        .await
        .map_err(|e| PageStoreError::Internal(e.to_string()))??;
        Ok(output)
    }

    /// Stop every tenant; uploads still queued are abandoned
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tenants: Vec<_> = self.tenants.write().drain().map(|(_, t)| t).collect();
        for tenant in tenants {
            tenant.shutdown().await;
        }
        info!("Tenant registry shut down");
    }

    async fn load_tenants(&self) -> Result<()> {
        let root = self.config.data_dir.join(TENANTS_DIR);
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(tenant_id) = name.parse::<TenantId>() else {
                warn!("Ignoring unexpected directory {:?}", entry.path());
                continue;
            };

            match Tenant::load(
                tenant_id,
                entry.path(),
                &self.config.default_tenant_conf,
                self.config.wal.clone(),
                self.remote(),
                self.cancel.child_token(),
            )
            .await
            {
                Ok(tenant) => {
                    if self.config.background_tasks {
                        tenant.start_background_loops();
                    }
                    self.tenants.write().insert(tenant_id, tenant);
                    info!("Loaded tenant: {}", tenant_id);
                }
                Err(e) => {
                    warn!("Failed to load tenant {}: {}", tenant_id, e);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("data_dir", &self.config.data_dir)
            .field("tenants", &self.tenants.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteStorageConfig;
    use crate::{Delta, Key};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            data_dir: dir.path().to_path_buf(),
            background_tasks: false,
            ..StorageConfig::default()
        }
    }

    #[tokio::test]
    async fn test_registry_restart() {
        let temp_dir = TempDir::new().unwrap();
        let (tenant_id, timeline_id) = {
            let registry = TenantRegistry::new(config(&temp_dir)).await.unwrap();
            let tenant = registry.create_tenant(None, None).unwrap();
            let timeline = registry
                .create_timeline(tenant.id(), CreateTimeline::default())
                .unwrap();
            timeline.ingest(Lsn(10), &[Delta::put(Key::new(1, 1, 0), "persisted")]).unwrap();
            registry
                .execute(AdminCommand::Checkpoint {
                    tenant_id: tenant.id(),
                    timeline_id: timeline.timeline_id(),
                })
                .await
                .unwrap();
            timeline.ingest(Lsn(20), &[Delta::put(Key::new(1, 1, 1), "replayed")]).unwrap();
            registry.shutdown().await;
            (tenant.id(), timeline.timeline_id())
        };

        let registry = TenantRegistry::new(config(&temp_dir)).await.unwrap();
        let timeline = registry.get_timeline(tenant_id, timeline_id).unwrap();
        assert_eq!(timeline.disk_consistent_lsn(), Lsn(10));
        assert_eq!(timeline.last_record_lsn(), Lsn(20));
        assert_eq!(
            timeline.get(Key::new(1, 1, 1), Lsn(20)).unwrap().as_deref(),
            Some(&b"replayed"[..])
        );
        assert!(matches!(
            registry.get_tenant(TenantId::generate()),
            Err(PageStoreError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_last_timeline_deletion_removes_tenant() {
        let temp_dir = TempDir::new().unwrap();
        let registry = TenantRegistry::new(config(&temp_dir)).await.unwrap();
        let tenant = registry.create_tenant(None, None).unwrap();
        let a = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();
        let b = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();

        registry.delete_timeline(tenant.id(), a.timeline_id()).await.unwrap();
        assert!(registry.get_tenant(tenant.id()).is_ok());
        registry.delete_timeline(tenant.id(), b.timeline_id()).await.unwrap();
        assert!(registry.get_tenant(tenant.id()).is_err());
        assert!(!tenant.dir().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tenants_reach_remote_consistency() {
        let temp_dir = TempDir::new().unwrap();
        let registry = TenantRegistry::new(StorageConfig {
            remote_storage: Some(RemoteStorageConfig::InMemory),
            ..config(&temp_dir)
        })
        .await
        .unwrap();
        let conf = TenantConf {
            checkpoint_distance: 16 * 1024,
            ..TenantConf::default()
        };

        let mut workloads = Vec::new();
        for _ in 0..4 {
            let tenant = registry.create_tenant(None, Some(conf.clone())).unwrap();
            let timeline = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();
            workloads.push(tokio::task::spawn_blocking(move || {
                for i in 0..300u32 {
                    let delta = Delta::put(Key::new(1, i % 3, i % 40), vec![i as u8; 100 + (i % 50) as usize]);
                    timeline.ingest(Lsn(u64::from(i) + 1), &[delta]).unwrap();
                }
                (tenant, timeline)
            }));
        }

        for workload in workloads {
            let (tenant, timeline) = workload.await.unwrap();
            let ids = (tenant.id(), timeline.timeline_id());
            registry
                .execute(AdminCommand::Checkpoint { tenant_id: ids.0, timeline_id: ids.1 })
                .await
                .unwrap();
            let written = timeline.last_record_lsn();
            timeline.wait_for_upload(written, Duration::from_secs(20)).await.unwrap();

            let detail = timeline.detail(true).unwrap();
            assert_eq!(detail.remote_consistent_lsn, Some(written));
            assert_eq!(detail.disk_consistent_lsn, written);
            assert_eq!(detail.current_logical_size_non_incremental, Some(detail.current_logical_size));
            assert_eq!(detail.current_physical_size_non_incremental, Some(detail.current_physical_size));
            assert_eq!(tenant.status().current_physical_size, detail.current_physical_size);
        }
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_do_gc_command_sums_results() {
        let temp_dir = TempDir::new().unwrap();
        let registry = TenantRegistry::new(StorageConfig {
            remote_storage: Some(RemoteStorageConfig::InMemory),
            ..config(&temp_dir)
        })
        .await
        .unwrap();
        let tenant = registry.create_tenant(None, None).unwrap();
        let timeline = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();
        let ids = (tenant.id(), timeline.timeline_id());

        let mut lsn = 0;
        for generation in 0..3u8 {
            for block in 0..5 {
                lsn += 1;
                timeline
                    .ingest(Lsn(lsn), &[Delta::put(Key::new(1, 1, block), vec![generation; 64])])
                    .unwrap();
            }
            registry
                .execute(AdminCommand::Checkpoint { tenant_id: ids.0, timeline_id: ids.1 })
                .await
                .unwrap();
        }

        let output = registry
            .execute(AdminCommand::DoGc {
                tenant_id: ids.0,
                timeline_id: ids.1,
                pitr: Duration::ZERO,
            })
            .await
            .unwrap();
        let CommandOutput::Gc(result) = output else {
            panic!("expected a GC result, got {:?}", output);
        };
        assert_eq!(result.layers_removed, 3);
        assert_eq!(result.images_created, 1);

        timeline
            .wait_for_upload(timeline.disk_consistent_lsn(), Duration::from_secs(10))
            .await
            .unwrap();
        let remote = timeline.remote_client().unwrap();
        remote.wait_completion(Duration::from_secs(10)).await.unwrap();
        assert_eq!(remote.projected_layers().len(), 1);
        registry.shutdown().await;
    }
}
