//! Prometheus text exposition of per-timeline gauges

use super::AppState;
use axum::extract::State;
use pagestore_core::storage::Timeline;
use std::fmt::Write;

struct Gauge {
    name: &'static str,
    help: &'static str,
    value: fn(&Timeline) -> Option<u64>,
}

const TIMELINE_GAUGES: &[Gauge] = &[
    Gauge {
        name: "storage_current_physical_size",
        help: "Bytes of layer files of the timeline (incremental)",
        value: |t| Some(t.physical_size()),
    },
    Gauge {
        name: "storage_current_logical_size",
        help: "Bytes of live values at the last record LSN (incremental)",
        value: |t| Some(t.logical_size()),
    },
    Gauge {
        name: "storage_last_record_lsn",
        help: "Last ingested LSN",
        value: |t| Some(t.last_record_lsn().0),
    },
    Gauge {
        name: "storage_disk_consistent_lsn",
        help: "LSN up to which everything is in local layer files",
        value: |t| Some(t.disk_consistent_lsn().0),
    },
    Gauge {
        name: "storage_remote_consistent_lsn",
        help: "LSN covered by the last uploaded manifest",
        value: |t| t.remote_consistent_lsn().map(|lsn| lsn.0),
    },
    Gauge {
        name: "storage_remote_physical_size",
        help: "Bytes of layer files referenced by the last uploaded manifest",
        value: |t| t.remote_client().map(|r| r.remote_physical_size()),
    },
    Gauge {
        name: "storage_latest_gc_cutoff_lsn",
        help: "LSN below which history is no longer readable",
        value: |t| Some(t.latest_gc_cutoff_lsn().0),
    },
    Gauge {
        name: "storage_upload_queue_length",
        help: "Remote operations queued or in flight",
        value: |t| t.remote_client().map(|r| r.queue_len() as u64),
    },
];

pub(super) async fn render(State(registry): State<AppState>) -> String {
    let timelines: Vec<_> = registry
        .list_tenants()
        .iter()
        .flat_map(|tenant| tenant.list_timelines())
        .collect();

    let mut output = String::new();
    let _ = writeln!(output, "# HELP storage_tenants Number of loaded tenants");
    let _ = writeln!(output, "# TYPE storage_tenants gauge");
    let _ = writeln!(output, "storage_tenants {}", registry.list_tenants().len());

    for gauge in TIMELINE_GAUGES {
        let _ = writeln!(output, "# HELP {} {}", gauge.name, gauge.help);
        let _ = writeln!(output, "# TYPE {} gauge", gauge.name);
        for timeline in &timelines {
            if let Some(value) = (gauge.value)(timeline) {
                let _ = writeln!(
                    output,
                    "{}{{tenant_id=\"{}\",timeline_id=\"{}\"}} {}",
                    gauge.name,
                    timeline.tenant_id(),
                    timeline.timeline_id(),
                    value
                );
            }
        }
    }
    output
}
