use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ferry_proto::{
    Channel, Error, FileRoot, MAX_LINE_BYTES, ReasonCode, Request, Response, ServeOutcome,
    TransferLogger, serve_file,
};

use crate::registry::{Registration, Registry};

/// Everything a connection handler needs besides its own socket.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Registry,
    pub root: FileRoot,
    /// Per-read idle guard. `None` waits forever.
    pub idle_timeout: Option<Duration>,
    pub logger: Arc<dyn TransferLogger>,
}

/// Why a connection loop ended.
#[derive(Debug, PartialEq, Eq)]
pub enum CloseReason {
    Quit,
    PeerClosed,
}

/// Drive one connection until it quits, closes, or breaks.
///
/// The connection is registered on entry and unregistered on every way out:
/// the registration guard lives in this frame.
pub async fn handle_connection<R, W>(
    mut channel: Channel<R, W>,
    registration: Registration,
    ctx: &SessionContext,
) -> ferry_proto::Result<CloseReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut registration = registration;
    let addr = registration.addr();
    info!("{} connected ({})", addr, registration.conn_id());

    let result = run_connection_loop(&mut channel, &mut registration, ctx).await;
    drop(registration);
    let _ = channel.shutdown().await;

    match &result {
        Ok(reason) => info!("{} disconnected: {:?}", addr, reason),
        Err(e) if is_disconnect(e) => info!("{} disconnected: {}", addr, e),
        Err(e) => warn!("{} dropped: {}", addr, e),
    }
    result
}

async fn run_connection_loop<R, W>(
    channel: &mut Channel<R, W>,
    registration: &mut Registration,
    ctx: &SessionContext,
) -> ferry_proto::Result<CloseReason>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let addr = registration.addr();
    let conn_id = registration.conn_id();
    // Only inbound lines push this forward; outbound chat does not count.
    let mut deadline = ctx.idle_timeout.map(|t| Instant::now() + t);

    loop {
        tokio::select! {
            line = channel.recv_line(MAX_LINE_BYTES) => {
                let Some(line) = line? else {
                    return Ok(CloseReason::PeerClosed);
                };
                deadline = ctx.idle_timeout.map(|t| Instant::now() + t);
                if line.is_empty() {
                    continue;
                }
                debug!("{} -> {}", addr, line);

                match Request::parse(&line) {
                    Request::Quit => return Ok(CloseReason::Quit),
                    Request::File(name) => {
                        let outcome = serve_file(
                            channel,
                            &ctx.root,
                            &name,
                            ctx.idle_timeout,
                            ctx.logger.as_ref(),
                        )
                        .await?;
                        deadline = ctx.idle_timeout.map(|t| Instant::now() + t);
                        match outcome {
                            ServeOutcome::Sent(meta) => {
                                info!("{} sent {} ({} bytes)", addr, meta.name, meta.size)
                            }
                            ServeOutcome::Refused(code) => info!("{} refused {}: {}", addr, name, code),
                            ServeOutcome::NotReady => warn!("{} not ready for {}", addr, name),
                        }
                    }
                    Request::Chat(text) => {
                        if text.is_empty() {
                            continue;
                        }
                        info!("chat from {}: {}", addr, text);
                        let report = ctx.registry.broadcast(Some(conn_id), &format!("{}: {}", addr, text));
                        debug!("chat fan-out: {} delivered, {} pruned", report.delivered, report.pruned.len());
                    }
                    Request::MissingFilename => {
                        channel.send_line(&Response::Error(ReasonCode::MissingFilename).to_line()).await?;
                    }
                    Request::Unknown(cmd) => {
                        let shown: String = cmd.chars().take(32).collect();
                        warn!("{} unknown command {:?}", addr, shown);
                        channel.send_line(&Response::Error(ReasonCode::UnknownCommand).to_line()).await?;
                    }
                }
            }
            Some(frame) = registration.outbound.recv() => {
                channel.send_bytes(&frame).await?;
                channel.flush().await?;
            }
            _ = idle_expired(deadline) => {
                let idle = ctx.idle_timeout.unwrap_or_default();
                return Err(Error::ConnectionLost(format!("idle for {:?}", idle)));
            }
        }
    }
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// True for errors that simply mean the peer went away.
pub fn is_disconnect(err: &Error) -> bool {
    matches!(err, Error::ConnectionLost(_))
}
