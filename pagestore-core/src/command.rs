//! Administrative commands
//!
//! Textual form, one command per line:
//! ```text
//! checkpoint <tenant_id> <timeline_id>
//! compact <tenant_id> <timeline_id>
//! do_gc <tenant_id> <timeline_id> <pitr_seconds>
//! ```

use crate::compaction::GcResult;
use crate::{PageStoreError, Result, TenantId, TimelineId};
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    /// Forced checkpoint; done once everything ingested is locally durable
    Checkpoint { tenant_id: TenantId, timeline_id: TimelineId },
    /// On-demand compaction
    Compact { tenant_id: TenantId, timeline_id: TimelineId },
    /// On-demand GC keeping `pitr` of history
    DoGc {
        tenant_id: TenantId,
        timeline_id: TimelineId,
        pitr: Duration,
    },
}

impl AdminCommand {
    pub fn target(&self) -> (TenantId, TimelineId) {
        match *self {
            AdminCommand::Checkpoint { tenant_id, timeline_id }
            | AdminCommand::Compact { tenant_id, timeline_id }
            | AdminCommand::DoGc { tenant_id, timeline_id, .. } => (tenant_id, timeline_id),
        }
    }
}

impl FromStr for AdminCommand {
    type Err = PageStoreError;

    fn from_str(line: &str) -> Result<Self> {
        let invalid = |reason: &str| PageStoreError::InvalidFormat(format!("{}: {:?}", reason, line.trim()));
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or_else(|| invalid("empty command"))?;
        let tenant_id: TenantId = words.next().ok_or_else(|| invalid("missing tenant id"))?.parse()?;
        let timeline_id: TimelineId = words.next().ok_or_else(|| invalid("missing timeline id"))?.parse()?;

        let command = match verb.to_ascii_lowercase().as_str() {
            "checkpoint" => AdminCommand::Checkpoint { tenant_id, timeline_id },
            "compact" => AdminCommand::Compact { tenant_id, timeline_id },
            "do_gc" => {
                let seconds: u64 = words
                    .next()
                    .ok_or_else(|| invalid("missing pitr_seconds"))?
                    .parse()
                    .map_err(|_| invalid("pitr_seconds is not a number"))?;
                AdminCommand::DoGc {
                    tenant_id,
                    timeline_id,
                    pitr: Duration::from_secs(seconds),
                }
            }
            _ => return Err(invalid("unknown command")),
        };
        if words.next().is_some() {
            return Err(invalid("unexpected trailing arguments"));
        }
        Ok(command)
    }
}

/// What a command produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CommandOutput {
    Done,
    Gc(GcResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let tenant = TenantId::generate();
        let timeline = TimelineId::generate();

        let cmd: AdminCommand = format!("checkpoint {} {}", tenant, timeline).parse().unwrap();
        assert_eq!(cmd, AdminCommand::Checkpoint { tenant_id: tenant, timeline_id: timeline });

        let cmd: AdminCommand = format!("  compact {} {}\n", tenant, timeline).parse().unwrap();
        assert_eq!(cmd.target(), (tenant, timeline));

        let cmd: AdminCommand = format!("do_gc {} {} 0", tenant, timeline).parse().unwrap();
        assert_eq!(
            cmd,
            AdminCommand::DoGc {
                tenant_id: tenant,
                timeline_id: timeline,
                pitr: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        let tenant = TenantId::generate();
        let timeline = TimelineId::generate();
        for line in [
            String::new(),
            "checkpoint".to_string(),
            format!("checkpoint {}", tenant),
            format!("checkpoint {} not-an-id", tenant),
            format!("do_gc {} {}", tenant, timeline),
            format!("do_gc {} {} soon", tenant, timeline),
            format!("vacuum {} {}", tenant, timeline),
            format!("compact {} {} extra", tenant, timeline),
        ] {
            assert!(line.parse::<AdminCommand>().is_err(), "{:?} should not parse", line);
        }
    }
}
