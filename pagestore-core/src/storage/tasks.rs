//! Periodic per-tenant background loops
//!
//! Each loop wakes on its own period, runs one iteration on the blocking
//! pool and stops when the tenant is cancelled. A zero period disables it.

use super::Tenant;
use crate::compaction::GcTarget;
use crate::{PageStoreError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

type Iteration = fn(&Tenant) -> Result<()>;

pub(super) fn spawn_background_loops(tenant: &Arc<Tenant>) {
    let Ok(handle) = Handle::try_current() else {
        warn!(tenant_id = %tenant.id(), "No async runtime, background loops not started");
        return;
    };
    let conf = tenant.conf();
    let loops: [(&'static str, Duration, Iteration); 4] = [
        ("compaction", conf.compaction_period, Tenant::compaction_iteration),
        ("gc", conf.gc_period, gc_iteration),
        ("checkpoint", conf.checkpoint_timeout, Tenant::checkpoint_iteration),
        ("size reconcile", conf.size_reconcile_period, Tenant::reconcile_sizes),
    ];

    let mut tasks = tenant.tasks.lock();
    for (name, period, iteration) in loops {
        if period.is_zero() {
            debug!(tenant_id = %tenant.id(), "{} loop disabled", name);
            continue;
        }
        tasks.push(spawn_periodic(&handle, Arc::clone(tenant), name, period, iteration));
    }
}

fn gc_iteration(tenant: &Tenant) -> Result<()> {
    tenant
        .gc_iteration(None, GcTarget::Pitr(tenant.conf.pitr_interval), false)
        .map(|_| ())
}

fn spawn_periodic(
    handle: &Handle,
    tenant: Arc<Tenant>,
    name: &'static str,
    period: Duration,
    iteration: Iteration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let cancel = tenant.cancel.clone();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let tenant = Arc::clone(&tenant);
            match tokio::task::spawn_blocking(move || iteration(&tenant)).await {
                Ok(Ok(())) => {}
                Ok(Err(PageStoreError::Cancelled)) => break,
                Ok(Err(e)) if e.is_user_visible() => error!("{} iteration failed: {}", name, e),
                Ok(Err(e)) => warn!("{} iteration failed: {}", name, e),
                Err(e) => error!("{} iteration panicked: {}", name, e),
            }
        }
        debug!("{} loop stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::super::{TenantConf, WalSettings};
    use super::*;
    use crate::{Delta, Key, Lsn, TenantId, TimelineId};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_loop_flushes_idle_layer() {
        let temp_dir = TempDir::new().unwrap();
        let conf = TenantConf {
            checkpoint_timeout: Duration::from_millis(50),
            compaction_period: Duration::ZERO,
            gc_period: Duration::ZERO,
            size_reconcile_period: Duration::from_millis(50),
            ..TenantConf::default()
        };
        let tenant = Tenant::create(
            TenantId::generate(),
            temp_dir.path().join("tenant"),
            conf,
            WalSettings::default(),
            None,
            CancellationToken::new(),
        )
        .unwrap();
        let timeline = tenant.create_timeline(TimelineId::generate(), None).unwrap();
        timeline.ingest(Lsn(7), &[Delta::put(Key::new(1, 1, 0), "idle")]).unwrap();

        tenant.start_background_loops();
        assert_eq!(tenant.tasks.lock().len(), 2);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while timeline.disk_consistent_lsn() < Lsn(7) {
            assert!(tokio::time::Instant::now() < deadline, "open layer never flushed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tenant.shutdown().await;
        assert!(tenant.tasks.lock().is_empty());
    }
}
