//! File transfer handshake, both ends.
//!
//! ```text
//! requester                      responder
//!   FILE <name>        ───────▶
//!                      ◀───────  OK <name> <size> <sha256>   | ERROR <reason>
//!   READY              ───────▶
//!                      ◀───────  <size raw bytes>
//! ```
//!
//! The requester recomputes the digest over what it wrote and compares it with
//! the one announced in `OK`.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::channel::{Channel, MAX_LINE_BYTES};
use crate::error::{Error, Result};
use crate::hasher::{hash_file, hash_reader};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::request::{
    CMD_CANCEL, CMD_FILE, CMD_READY, RESP_OK, ReasonCode, Response, TransferMetadata,
    chat_frame_text,
};
use crate::storage::{FileRoot, validate_name};

/// Payload bytes moved per read/write.
pub const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

/// How a responder session ended without breaking the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    Sent(TransferMetadata),
    Refused(ReasonCode),
    /// Peer replied to `OK` with something other than `READY`.
    NotReady,
}

/// Serve `FILE <name>` from `root`.
///
/// Errors returned from here mean the channel is no longer usable; request
/// level failures are answered on the wire and reported as a `ServeOutcome`.
pub async fn serve_file<R, W>(
    channel: &mut Channel<R, W>,
    root: &FileRoot,
    name: &str,
    idle: Option<Duration>,
    logger: &dyn TransferLogger,
) -> Result<ServeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let log = |event| logger.log(TransferLog { component: "responder", file: name, event });

    let (mut file, size) = match root.open_for_send(name).await {
        Ok(found) => found,
        Err(e) => {
            log(TransferEvent::Error { message: e.to_string() });
            return refuse(channel, ReasonCode::NotFound).await;
        }
    };

    let checksum = match hash_then_rewind(&mut file).await {
        Ok(sum) => sum,
        Err(e) => {
            log(TransferEvent::Error { message: format!("hashing failed: {}", e) });
            return refuse(channel, ReasonCode::HashFailure).await;
        }
    };

    let metadata = TransferMetadata { name: name.to_string(), size, checksum };
    channel.send_line(&Response::Ok(metadata.clone()).to_line()).await?;

    let reply = channel
        .recv_line_within(MAX_LINE_BYTES, idle)
        .await?
        .ok_or_else(|| Error::ConnectionLost("peer closed before READY".into()))?;
    if reply != CMD_READY {
        log(TransferEvent::PeerNotReady { reply });
        return Ok(ServeOutcome::NotReady);
    }
    log(TransferEvent::PeerReady);

    let started = Instant::now();
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut sent: u64 = 0;
    while sent < size {
        let want = (TRANSFER_CHUNK_SIZE as u64).min(size - sent) as usize;
        let n = match file.read(&mut buf[..want]).await {
            Ok(0) => Err(Error::Protocol(format!("file shrank to {} of {} bytes", sent, size))),
            Ok(n) => Ok(n),
            Err(e) => Err(Error::Io(e)),
        };
        let n = match n {
            Ok(n) => n,
            Err(e) => {
                log(TransferEvent::Error { message: e.to_string() });
                // Mid-payload the peer cannot resynchronise; report and let the
                // caller drop the connection.
                let _ = channel.send_line(&Response::Error(ReasonCode::SendFailure).to_line()).await;
                return Err(e);
            }
        };
        channel.send_bytes(&buf[..n]).await?;
        sent += n as u64;
    }
    channel.flush().await?;

    log(TransferEvent::TransferComplete {
        total_bytes: sent,
        duration_ms: started.elapsed().as_millis() as u64,
    });
    Ok(ServeOutcome::Sent(metadata))
}

async fn refuse<R, W>(channel: &mut Channel<R, W>, code: ReasonCode) -> Result<ServeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    channel.send_line(&Response::Error(code.clone()).to_line()).await?;
    Ok(ServeOutcome::Refused(code))
}

async fn hash_then_rewind(file: &mut fs::File) -> std::io::Result<String> {
    let sum = hash_reader(file).await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(sum)
}

/// Result of a completed requester session.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub metadata: TransferMetadata,
    pub path: PathBuf,
    /// Digest recomputed over the written file.
    pub actual_checksum: String,
}

impl TransferOutcome {
    pub fn verified(&self) -> bool {
        self.actual_checksum == self.metadata.checksum
    }

    /// `Err(Integrity)` when the digests differ. The file stays on disk
    /// either way.
    pub fn verify(&self) -> Result<()> {
        if self.verified() {
            Ok(())
        } else {
            Err(Error::Integrity {
                expected: self.metadata.checksum.clone(),
                actual: self.actual_checksum.clone(),
            })
        }
    }
}

/// Fetch `name` from the peer into `dest`.
///
/// Chat frames that arrive while waiting for the response are passed to the
/// logger as `ChatInterleaved`. An `ERROR` answer becomes `Error::Remote` and
/// leaves nothing on disk.
///
/// Every error except `ConnectionLost` leaves the channel in sync, ready for
/// the next request.
pub async fn request_file<R, W>(
    channel: &mut Channel<R, W>,
    dest: &FileRoot,
    name: &str,
    logger: &dyn TransferLogger,
) -> Result<TransferOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let log = |event| logger.log(TransferLog { component: "requester", file: name, event });

    validate_name(name)?;
    channel.send_line(&format!("{} {}", CMD_FILE, name)).await?;

    let metadata = loop {
        let line = channel
            .recv_line(MAX_LINE_BYTES)
            .await
            .map_err(desync)?
            .ok_or_else(|| Error::ConnectionLost("peer closed before responding".into()))?;
        if let Some(text) = chat_frame_text(&line) {
            log(TransferEvent::ChatInterleaved { text: text.to_string() });
            continue;
        }
        match Response::parse(&line) {
            Ok(Response::Ok(metadata)) => break metadata,
            Ok(Response::Error(code)) => return Err(Error::Remote(code)),
            Err(e) => {
                // The responder is waiting for READY; tell it not to send.
                if line.starts_with(RESP_OK) {
                    let _ = channel.send_line(CMD_CANCEL).await;
                }
                return Err(e);
            }
        }
    };

    if metadata.name != name {
        channel.send_line(CMD_CANCEL).await?;
        return Err(Error::Protocol(format!(
            "asked for {:?}, peer offered {:?}",
            name, metadata.name
        )));
    }
    let (mut file, path) = match dest.create_for_receive(name).await {
        Ok(opened) => opened,
        Err(e) => {
            channel.send_line(CMD_CANCEL).await?;
            return Err(e);
        }
    };

    log(TransferEvent::MetadataReceived {
        size: metadata.size,
        checksum: metadata.checksum.clone(),
    });
    channel.send_line(CMD_READY).await?;

    let started = Instant::now();
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
    let mut received: u64 = 0;
    while received < metadata.size {
        let want = (TRANSFER_CHUNK_SIZE as u64).min(metadata.size - received) as usize;
        if let Err(e) = channel.recv_exact(&mut buf[..want]).await {
            let _ = file.flush().await;
            log(TransferEvent::Error {
                message: format!(
                    "{}; partial file ({} of {} bytes) left at {}",
                    e,
                    received,
                    metadata.size,
                    path.display()
                ),
            });
            return Err(e);
        }
        received += want as u64;
        if let Err(e) = file.write_all(&buf[..want]).await {
            log(TransferEvent::Error { message: format!("write to {} failed: {}", path.display(), e) });
            // Consume the rest so the next control line lines up.
            discard(channel, &mut buf, metadata.size - received).await?;
            return Err(Error::Io(e));
        }
        log(TransferEvent::Progress { done: received, total: metadata.size });
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    log(TransferEvent::TransferComplete {
        total_bytes: received,
        duration_ms: started.elapsed().as_millis() as u64,
    });

    let actual_checksum = hash_file(&path).await?;
    if actual_checksum == metadata.checksum {
        log(TransferEvent::Verified { checksum: actual_checksum.clone() });
    } else {
        log(TransferEvent::IntegrityMismatch {
            expected: metadata.checksum.clone(),
            actual: actual_checksum.clone(),
        });
    }

    Ok(TransferOutcome { metadata, path, actual_checksum })
}

/// An unframeable control line leaves the stream position unknown.
fn desync(e: Error) -> Error {
    match e {
        Error::Protocol(msg) => Error::ConnectionLost(format!("framing lost: {}", msg)),
        other => other,
    }
}

async fn discard<R, W>(channel: &mut Channel<R, W>, buf: &mut [u8], mut left: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while left > 0 {
        let want = (buf.len() as u64).min(left) as usize;
        channel.recv_exact(&mut buf[..want]).await?;
        left -= want as u64;
    }
    Ok(())
}
