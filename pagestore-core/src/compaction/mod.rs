//! Compaction and garbage collection of persistent layers
//!
//! Compaction merges the level 0 delta layers (those spanning the whole key
//! space, produced by checkpoints) into key-partitioned delta layers. GC
//! materializes image layers and removes layers that no read at or above
//! the GC cutoff, nor any child branch, can reach anymore.
//!
//! Both mutate the historic layer set and are serialized per timeline by
//! `layer_removal_cs`. New layer files are durable before the layer map
//! swap; the metadata is rewritten right after it.

mod gc;

pub use gc::{GcResult, GcTarget};

use crate::layer::{LayerWriter, PersistentLayer};
use crate::storage::Timeline;
use crate::types::duration_format;
use crate::{Key, PageStoreError, Record, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionResult {
    pub input_layers: usize,
    pub output_layers: usize,
    pub input_bytes: u64,
    pub output_bytes: u64,
    #[serde(with = "duration_format")]
    pub elapsed: Duration,
}

impl Timeline {
    /// Merge level 0 deltas once there are `compaction_threshold` of them
    ///
    /// With `force` any two or more are merged.
    pub fn compact(&self, force: bool) -> Result<CompactionResult> {
        let _removal = self.layer_removal_cs.lock();
        if self.cancel.is_cancelled() {
            return Err(PageStoreError::Cancelled);
        }
        let started = Instant::now();

        let inputs = self.layers.read().l0_deltas();
        let threshold = if force { 2 } else { self.conf.compaction_threshold.max(2) };
        if inputs.len() < threshold {
            debug!(
                timeline_id = %self.timeline_id,
                "Skipping compaction: {} level 0 layers, threshold {}",
                inputs.len(),
                threshold
            );
            return Ok(CompactionResult::default());
        }

        let mut records = Vec::new();
        for layer in &inputs {
            records.extend(layer.load()?);
        }
        records.sort_by(|a, b| (a.key, a.lsn).cmp(&(b.key, b.lsn)));
        records.dedup_by(|a, b| a.key == b.key && a.lsn == b.lsn);

        let total: u64 = records.iter().map(|r| r.size() as u64).sum();
        let n = inputs.len() as u64;
        let target = self.conf.compaction_target_size.max((total + n - 1) / n);

        let lsn_range = inputs[0].name().lsn_range.start..inputs[inputs.len() - 1].name().lsn_range.end;
        let mut outputs: Vec<Arc<PersistentLayer>> = Vec::new();
        for (key_range, part) in partition(&records, target) {
            let mut writer = LayerWriter::new_delta(self.dir.clone(), key_range, lsn_range.clone());
            let written = part
                .iter()
                .try_for_each(|record| writer.add(record))
                .and_then(|_| writer.finish());
            match written {
                Ok(layer) => outputs.push(Arc::new(layer)),
                Err(e) => {
                    // not referenced by metadata yet
                    for output in &outputs {
                        output.mark_deleted();
                    }
                    return Err(e);
                }
            }
        }

        let input_bytes: u64 = inputs.iter().map(|l| l.file_size()).sum();
        let output_bytes: u64 = outputs.iter().map(|l| l.file_size()).sum();
        {
            let mut layers = self.layers.write();
            layers.replace_historic(&inputs, outputs.clone());
            self.size.add_physical(output_bytes);
            self.size.sub_physical(input_bytes);
        }
        self.save_metadata()?;
        for input in &inputs {
            input.mark_deleted();
        }

        if let Some(remote) = &self.remote {
            for output in &outputs {
                remote.schedule_layer_upload(Arc::clone(output));
            }
            let names = inputs.iter().map(|l| l.file_name().to_string()).collect();
            remote.schedule_layer_removal(names, self.index());
        }

        let result = CompactionResult {
            input_layers: inputs.len(),
            output_layers: outputs.len(),
            input_bytes,
            output_bytes,
            elapsed: started.elapsed(),
        };
        info!(
            tenant_id = %self.tenant_id,
            timeline_id = %self.timeline_id,
            "Compacted {} level 0 layers ({} bytes) into {} layers ({} bytes) in {:?}",
            result.input_layers,
            result.input_bytes,
            result.output_layers,
            result.output_bytes,
            result.elapsed
        );
        Ok(result)
    }
}

/// Split key-ordered records into key ranges of at least `target` bytes
///
/// Partitions close only at key boundaries, the first starts at `Key::MIN`
/// and the last ends at `Key::MAX`, so together they cover the key space.
fn partition(records: &[Record], target: u64) -> Vec<(Range<Key>, &[Record])> {
    let mut parts = Vec::new();
    let mut start_idx = 0;
    let mut start_key = Key::MIN;
    let mut bytes = 0u64;
    for (i, record) in records.iter().enumerate() {
        if i > start_idx && record.key != records[i - 1].key && bytes >= target {
            parts.push((start_key..record.key, &records[start_idx..i]));
            start_idx = i;
            start_key = record.key;
            bytes = 0;
        }
        bytes += record.size() as u64;
    }
    if start_idx < records.len() {
        parts.push((start_key..Key::MAX, &records[start_idx..]));
    }
    parts
}
