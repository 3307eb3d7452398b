//! Line based admin control channel
//!
//! Each request line is one [`AdminCommand`]; each reply is a single line:
//! `OK`, `OK <json>` or `ERROR <message>`.

use pagestore_core::command::{AdminCommand, CommandOutput};
use pagestore_core::storage::TenantRegistry;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accept control connections until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, registry: Arc<TenantRegistry>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Control connection from {}", peer);
                    let registry = Arc::clone(&registry);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, registry, shutdown).await {
                            warn!("Control connection from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept control connection: {}", e),
            },
        }
    }
    info!("Control channel stopped");
}

async fn handle_connection(
    stream: TcpStream,
    registry: Arc<TenantRegistry>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        let mut reply = execute_line(&registry, &line).await;
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

/// Parse and run one command line, producing the reply without newline
pub async fn execute_line(registry: &TenantRegistry, line: &str) -> String {
    let command: AdminCommand = match line.parse() {
        Ok(command) => command,
        Err(e) => return format!("ERROR {}", e),
    };
    debug!("Control command: {:?}", command);
    match registry.execute(command).await {
        Ok(CommandOutput::Done) => "OK".to_string(),
        Ok(output) => match serde_json::to_string(&output) {
            Ok(json) => format!("OK {}", json),
            Err(e) => format!("ERROR {}", e),
        },
        Err(e) => format!("ERROR {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagestore_core::storage::{CreateTimeline, StorageConfig};
    use pagestore_core::{Delta, Key, Lsn, TimelineId};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn registry(dir: &TempDir) -> Arc<TenantRegistry> {
        TenantRegistry::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            background_tasks: false,
            ..StorageConfig::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_line_replies() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir).await;
        let tenant = registry.create_tenant(None, None).unwrap();
        let timeline = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();
        timeline.ingest(Lsn(8), &[Delta::put(Key::new(1, 1, 0), "x")]).unwrap();

        let reply = execute_line(&registry, &format!("checkpoint {} {}", tenant.id(), timeline.timeline_id())).await;
        assert_eq!(reply, "OK");
        assert_eq!(timeline.disk_consistent_lsn(), Lsn(8));

        let reply = execute_line(&registry, &format!("do_gc {} {} 0", tenant.id(), timeline.timeline_id())).await;
        assert!(reply.starts_with("OK {"), "{}", reply);
        let result: serde_json::Value = serde_json::from_str(&reply[3..]).unwrap();
        assert_eq!(result["layers_removed"], 1);

        let reply = execute_line(&registry, &format!("compact {} {}", tenant.id(), TimelineId::generate())).await;
        assert!(reply.starts_with("ERROR Timeline not found"), "{}", reply);
        let reply = execute_line(&registry, "vacuum").await;
        assert!(reply.starts_with("ERROR"), "{}", reply);
    }

    #[tokio::test]
    async fn test_control_channel_over_tcp() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir).await;
        let tenant = registry.create_tenant(None, None).unwrap();
        let timeline = registry.create_timeline(tenant.id(), CreateTimeline::default()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, registry.clone(), shutdown.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "checkpoint {t} {tl}\n\ncompact {t} {tl}\nbogus\n",
            t = tenant.id(),
            tl = timeline.timeline_id()
        );
        client.write_all(request.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut replies = String::new();
        client.read_to_string(&mut replies).await.unwrap();
        let replies: Vec<_> = replies.lines().collect();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], "OK");
        assert_eq!(replies[1], "OK");
        assert!(replies[2].starts_with("ERROR"));

        shutdown.cancel();
        server.await.unwrap();
    }
}
