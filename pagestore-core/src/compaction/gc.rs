//! Garbage collection of layers below the PITR horizon

use crate::layer::{Layer, LayerWriter, PersistentLayer};
use crate::storage::Timeline;
use crate::types::duration_format;
use crate::{Key, Lsn, PageStoreError, Record, Result, Value};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Where GC puts its cutoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTarget {
    /// Keep history newer than this; zero keeps only the latest state
    Pitr(Duration),
    /// Explicit cutoff LSN
    Lsn(Lsn),
}

/// Outcome of a GC pass, summed over timelines by the tenant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResult {
    pub layers_total: u64,
    pub layers_needed_by_cutoff: u64,
    pub layers_needed_by_branches: u64,
    pub layers_not_updated: u64,
    pub layers_removed: u64,
    pub bytes_removed: u64,
    pub images_created: u64,
    #[serde(with = "duration_format")]
    pub elapsed: Duration,
}

impl AddAssign for GcResult {
    fn add_assign(&mut self, other: Self) {
        self.layers_total += other.layers_total;
        self.layers_needed_by_cutoff += other.layers_needed_by_cutoff;
        self.layers_needed_by_branches += other.layers_needed_by_branches;
        self.layers_not_updated += other.layers_not_updated;
        self.layers_removed += other.layers_removed;
        self.bytes_removed += other.bytes_removed;
        self.images_created += other.images_created;
        self.elapsed += other.elapsed;
    }
}

impl Timeline {
    /// One GC pass
    ///
    /// `branch_points` are the LSNs at which child timelines branched off
    /// this one. `on_demand` lowers the image creation threshold to a single
    /// delta layer.
    pub fn gc(&self, target: GcTarget, branch_points: &[Lsn], on_demand: bool) -> Result<GcResult> {
        let _removal = self.layer_removal_cs.lock();
        if self.cancel.is_cancelled() {
            return Err(PageStoreError::Cancelled);
        }
        let started = Instant::now();
        let mut result = GcResult::default();

        let Some(cutoff) = self.gc_cutoff(target) else {
            debug!(timeline_id = %self.timeline_id, "No checkpoint older than the PITR interval, skipping GC");
            return Ok(result);
        };
        if !cutoff.is_valid() {
            return Ok(result);
        }
        // reads below the new cutoff start failing before any layer goes away
        self.latest_gc_cutoff_lsn.store(cutoff.0, Ordering::Release);

        let threshold = if on_demand { 1 } else { self.conf.image_creation_threshold.max(1) };
        if let Some(image) = self.maybe_create_image(cutoff, threshold)? {
            result.images_created += 1;
            if let Some(remote) = &self.remote {
                remote.schedule_layer_upload(image);
            }
        }

        let historic = self.layers.read().historic().to_vec();
        let mut remove: Vec<Arc<PersistentLayer>> = Vec::new();
        for layer in &historic {
            result.layers_total += 1;
            let name = layer.name();
            let last_lsn = name.lsn_range.end.prev();
            if last_lsn > cutoff {
                result.layers_needed_by_cutoff += 1;
                continue;
            }

            // oldest image that makes this layer unnecessary
            let superseded_at = historic
                .iter()
                .filter(|other| other.is_image() && !Arc::ptr_eq(other, layer))
                .map(|other| other.name())
                .filter(|other| {
                    other.key_range.start <= name.key_range.start && name.key_range.end <= other.key_range.end
                })
                .map(|other| other.lsn_range.start)
                .filter(|&image_lsn| {
                    image_lsn <= cutoff
                        && if layer.is_image() {
                            image_lsn > last_lsn
                        } else {
                            image_lsn >= last_lsn
                        }
                })
                .min();
            let Some(image_lsn) = superseded_at else {
                result.layers_not_updated += 1;
                continue;
            };

            if branch_points
                .iter()
                .any(|&bp| bp >= name.lsn_range.start && bp < image_lsn)
            {
                result.layers_needed_by_branches += 1;
                continue;
            }
            remove.push(Arc::clone(layer));
        }

        if !remove.is_empty() {
            let bytes: u64 = remove.iter().map(|l| l.file_size()).sum();
            {
                let mut layers = self.layers.write();
                layers.replace_historic(&remove, Vec::new());
                self.size.sub_physical(bytes);
            }
            result.layers_removed = remove.len() as u64;
            result.bytes_removed = bytes;
        }
        self.save_metadata()?;
        for layer in &remove {
            layer.mark_deleted();
        }
        if let Some(remote) = &self.remote {
            let names = remove.iter().map(|l| l.file_name().to_string()).collect();
            remote.schedule_layer_removal(names, self.index());
        }

        result.elapsed = started.elapsed();
        info!(
            tenant_id = %self.tenant_id,
            timeline_id = %self.timeline_id,
            "GC at cutoff {}: removed {} of {} layers ({} bytes), {} needed by cutoff, {} by branches, {} not superseded, {} images created in {:?}",
            cutoff,
            result.layers_removed,
            result.layers_total,
            result.bytes_removed,
            result.layers_needed_by_cutoff,
            result.layers_needed_by_branches,
            result.layers_not_updated,
            result.images_created,
            result.elapsed
        );
        Ok(result)
    }

    /// Cutoff for `target`, clamped to `disk_consistent_lsn` and never
    /// below the previous cutoff
    fn gc_cutoff(&self, target: GcTarget) -> Option<Lsn> {
        let disk_consistent_lsn = self.disk_consistent_lsn();
        let wanted = match target {
            GcTarget::Lsn(lsn) => lsn,
            GcTarget::Pitr(interval) if interval.is_zero() => disk_consistent_lsn,
            GcTarget::Pitr(interval) => {
                let horizon = Utc::now() - chrono::Duration::from_std(interval).ok()?;
                let history = self.lsn_history.lock();
                history
                    .iter()
                    .rev()
                    .find(|(at, _)| *at <= horizon)
                    .map(|(_, lsn)| *lsn)?
            }
        };
        Some(wanted.min(disk_consistent_lsn).max(self.latest_gc_cutoff_lsn()))
    }

    /// Write a full key space image at `cutoff` when at least `threshold`
    /// delta layers sit between the newest image and the cutoff
    fn maybe_create_image(&self, cutoff: Lsn, threshold: usize) -> Result<Option<Arc<PersistentLayer>>> {
        let deltas_above = {
            let layers = self.layers.read();
            let base = layers.newest_full_image(cutoff).map(|l| l.name().lsn_range.start);
            if base == Some(cutoff) {
                return Ok(None);
            }
            layers
                .historic()
                .iter()
                .filter(|l| !l.is_image())
                .filter(|l| base.map_or(true, |b| l.name().lsn_range.start > b))
                .filter(|l| l.name().lsn_range.start <= cutoff)
                .count()
        };
        if deltas_above < threshold {
            return Ok(None);
        }

        let state = self.state_at(&(Key::MIN..Key::MAX), cutoff)?;
        let mut writer = LayerWriter::new_image(self.dir.clone(), Key::MIN..Key::MAX, cutoff);
        for (key, value) in state {
            writer.add(&Record::new(key, cutoff, Value::Put(value)))?;
        }
        let image = Arc::new(writer.finish()?);
        {
            let mut layers = self.layers.write();
            layers.insert_historic(Arc::clone(&image));
            self.size.add_physical(image.file_size());
        }
        debug!(
            timeline_id = %self.timeline_id,
            "Created image layer {} ({} bytes)",
            image.file_name(),
            image.file_size()
        );
        Ok(Some(image))
    }
}
