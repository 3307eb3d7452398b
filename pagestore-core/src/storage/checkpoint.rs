//! Checkpointing: freezing the open layer and flushing frozen layers to disk

use super::timeline::{Timeline, LSN_HISTORY_LEN};
use crate::layer::{LayerWriter, PersistentLayer};
use crate::memtable::InMemoryLayer;
use crate::{Key, Lsn, PageStoreError, Result};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

impl Timeline {
    /// Freeze and flush the open layer once it holds `checkpoint_distance` bytes
    pub fn maybe_checkpoint(&self) -> Result<()> {
        let open_size = self.layers.read().open_layer().map_or(0, |l| l.size() as u64);
        if open_size < self.conf.checkpoint_distance {
            return Ok(());
        }
        self.checkpoint(false)
    }

    /// Freeze the open layer and flush every frozen layer
    ///
    /// With `force` the open layer is frozen regardless of its size and the
    /// call returns only when everything ingested so far is durable on
    /// local disk.
    pub fn checkpoint(&self, force: bool) -> Result<()> {
        let froze = self.freeze_open_layer(force)?;
        self.flush_frozen_layers()?;
        if force && !froze {
            self.advance_idle_disk_consistent_lsn()?;
        }
        Ok(())
    }

    /// Flush the open layer if it is older than `checkpoint_timeout`
    pub(crate) fn checkpoint_if_stale(&self) -> Result<()> {
        let stale = self
            .layers
            .read()
            .open_layer()
            .map_or(false, |l| l.age() >= self.conf.checkpoint_timeout);
        if stale {
            debug!(timeline_id = %self.timeline_id, "Open layer exceeded checkpoint_timeout");
            self.checkpoint(true)?;
        }
        Ok(())
    }

    /// New ingests go to a fresh open layer once this returns
    fn freeze_open_layer(&self, force: bool) -> Result<bool> {
        let _write = self.write_lock.lock();
        let end_lsn = self.last_record_lsn().next();
        {
            let mut layers = self.layers.write();
            let Some(open) = layers.open_layer() else {
                return Ok(false);
            };
            if !force && (open.size() as u64) < self.conf.checkpoint_distance {
                return Ok(false);
            }
            layers.freeze_open(end_lsn);
        }
        self.wal.rotate(end_lsn)?;
        debug!(timeline_id = %self.timeline_id, "Froze open layer at {}", end_lsn);
        Ok(true)
    }

    fn flush_frozen_layers(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();
        loop {
            let frozen = self.layers.read().oldest_frozen();
            let Some(frozen) = frozen else { break };
            self.flush_frozen_layer(&frozen)?;
        }
        Ok(())
    }

    fn flush_frozen_layer(&self, frozen: &Arc<InMemoryLayer>) -> Result<()> {
        let started = Instant::now();
        let end_lsn = frozen
            .end_lsn()
            .ok_or_else(|| PageStoreError::Internal("flush of a layer that is not frozen".into()))?;

        let layer = if frozen.is_empty() {
            None
        } else {
            let mut writer =
                LayerWriter::new_delta(self.dir.clone(), Key::MIN..Key::MAX, frozen.start_lsn()..end_lsn);
            for record in frozen.iter() {
                writer.add(&record)?;
            }
            // durable before it becomes visible
            Some(Arc::new(writer.finish()?))
        };

        let disk_consistent_lsn = end_lsn.prev();
        {
            let mut layers = self.layers.write();
            if let Some(layer) = &layer {
                self.size.add_physical(layer.file_size());
            }
            layers.finish_flush(frozen, layer.clone());
            self.disk_consistent_lsn
                .store(disk_consistent_lsn.0, Ordering::Release);
        }
        self.persist_progress(layer.as_ref(), disk_consistent_lsn)?;

        info!(
            tenant_id = %self.tenant_id,
            timeline_id = %self.timeline_id,
            "Flushed {} records ({} bytes) in {:?}, disk_consistent_lsn {}",
            frozen.len(),
            layer.as_ref().map_or(0, |l| l.file_size()),
            started.elapsed(),
            disk_consistent_lsn
        );
        Ok(())
    }

    /// Everything up to `last_record_lsn` is already in persistent layers
    /// when nothing is open or frozen; a forced checkpoint then only moves
    /// `disk_consistent_lsn`
    fn advance_idle_disk_consistent_lsn(&self) -> Result<()> {
        let advanced = {
            let _write = self.write_lock.lock();
            let layers = self.layers.write();
            let last_record_lsn = self.last_record_lsn();
            if layers.open_layer().is_some()
                || layers.frozen_count() > 0
                || last_record_lsn <= self.disk_consistent_lsn()
            {
                None
            } else {
                self.disk_consistent_lsn
                    .store(last_record_lsn.0, Ordering::Release);
                Some(last_record_lsn)
            }
        };
        match advanced {
            Some(lsn) => self.persist_progress(None, lsn),
            None => Ok(()),
        }
    }

    /// Metadata, WAL truncation and uploads after `disk_consistent_lsn` moved
    fn persist_progress(&self, new_layer: Option<&Arc<PersistentLayer>>, disk_consistent_lsn: Lsn) -> Result<()> {
        self.save_metadata()?;
        {
            let mut history = self.lsn_history.lock();
            history.push_back((Utc::now(), disk_consistent_lsn));
            while history.len() > LSN_HISTORY_LEN {
                history.pop_front();
            }
        }
        self.wal.truncate(disk_consistent_lsn)?;
        if let Some(remote) = &self.remote {
            if let Some(layer) = new_layer {
                remote.schedule_layer_upload(Arc::clone(layer));
            }
            remote.schedule_manifest_upload(self.index());
        }
        Ok(())
    }
}
