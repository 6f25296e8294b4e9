use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use ferry_gateway::{Listener, ListenerConfig, Registry};
use ferry_proto::{FileRoot, TracingLogger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=debug,ferry_gateway=debug,ferry_proto=info".into()),
        )
        .init();

    // Config
    let host = std::env::var("FERRY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("FERRY_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()?;
    let file_root: PathBuf = std::env::var("FERRY_FILE_ROOT")
        .unwrap_or_else(|_| "./server_files".into())
        .into();
    let max_connections: usize = std::env::var("FERRY_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    let idle_secs: u64 = std::env::var("FERRY_IDLE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    let idle_timeout = (idle_secs > 0).then(|| Duration::from_secs(idle_secs));

    let root = FileRoot::new(file_root).await?;
    info!("serving files from {}", root.dir().display());

    let config = ListenerConfig { max_connections, idle_timeout };
    let listener = Listener::new(root, config, Arc::new(TracingLogger));

    tokio::spawn(run_console(listener.registry().clone()));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let socket = TcpListener::bind(addr).await?;
    info!("Ferry server listening on {}", addr);
    match idle_timeout {
        Some(t) => info!("max {} connections, idle timeout {}s", max_connections, t.as_secs()),
        None => info!("max {} connections, idle timeout disabled", max_connections),
    }

    tokio::select! {
        _ = listener.run(socket) => {}
        _ = shutdown_signal() => {}
    }

    Ok(())
}

/// Broadcast every non-empty line typed on stdin to all connected clients.
async fn run_console(registry: Registry) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                let report = registry.broadcast(None, &format!("server: {}", text));
                info!("console broadcast to {} clients", report.delivered);
                for addr in report.pruned {
                    debug!("pruned {} during broadcast", addr);
                }
            }
            Ok(None) => {
                info!("console input closed, broadcasts disabled");
                return;
            }
            Err(e) => {
                warn!("console read error: {}", e);
                return;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
