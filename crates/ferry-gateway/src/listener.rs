//! TCP accept loop.
//!
//! One task per accepted connection, capped by a semaphore. A connection that
//! arrives while the cap is reached is closed before any protocol exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use ferry_proto::{Error, FileRoot, TcpChannel, TransferLogger};

use crate::connection::{SessionContext, handle_connection};
use crate::registry::Registry;

/// 1 MB socket buffers for payload streaming.
const SOCKET_BUF_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub max_connections: usize,
    /// Per-read idle guard. `None` disables it.
    pub idle_timeout: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            idle_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Shared state for all connections of one server.
#[derive(Clone)]
pub struct Listener {
    ctx: SessionContext,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    pub fn new(root: FileRoot, config: ListenerConfig, logger: Arc<dyn TransferLogger>) -> Self {
        Self {
            ctx: SessionContext {
                registry: Registry::new(),
                root,
                idle_timeout: config.idle_timeout,
                logger,
            },
            permits: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        }
    }

    /// The registry of live connections, for out-of-band broadcast.
    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("rejecting {}: {}", addr, Error::Capacity(self.max_connections));
                drop(stream);
                return;
            }
        };

        info!("new connection from {}", addr);
        tune_socket(&stream);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let registration = ctx.registry.add(addr);
            let channel = TcpChannel::from_tcp(stream);
            // Outcome is logged by the handler.
            let _ = handle_connection(channel, registration, &ctx).await;
            drop(permit);
        });
    }
}

fn tune_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    let tuned = sock_ref
        .set_nodelay(true)
        .and_then(|_| sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE))
        .and_then(|_| sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE));
    if let Err(e) = tuned {
        warn!("socket tuning failed: {}", e);
    }
}
