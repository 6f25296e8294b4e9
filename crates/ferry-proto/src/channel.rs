//! Line + payload framing over a byte stream.
//!
//! Control lines are UTF-8 terminated by `\n`. A binary payload of a length
//! announced in a preceding control line follows with no extra framing, so
//! payload reads go through the same buffered reader as line reads.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{Error, Result};

/// Longest control line accepted, newline excluded.
pub const MAX_LINE_BYTES: usize = 1024;

/// Read buffer in front of the socket.
const READ_BUF_SIZE: usize = 64 * 1024;

pub struct Channel<R, W> {
    reader: BufReader<R>,
    writer: W,
    /// Bytes of a line not yet terminated. Survives a cancelled `recv_line`.
    pending: Vec<u8>,
}

pub type TcpChannel = Channel<OwnedReadHalf, OwnedWriteHalf>;

impl TcpChannel {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Channel::new(reader, writer)
    }
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_BUF_SIZE, reader),
            writer,
            pending: Vec::new(),
        }
    }

    /// Write one control line. The newline terminator is added here.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        if text.contains('\n') {
            return Err(Error::Protocol("control line contains a newline".into()));
        }
        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(b'\n');
        self.send_bytes(&frame).await?;
        self.writer.flush().await.map_err(lost)
    }

    /// Read one control line of at most `max_bytes`, trailing whitespace
    /// trimmed. `Ok(None)` means the peer closed cleanly between lines.
    ///
    /// Cancellation safe: a partially received line is kept for the next call.
    pub async fn recv_line(&mut self, max_bytes: usize) -> Result<Option<String>> {
        loop {
            if self.pending.last() == Some(&b'\n') {
                let raw = std::mem::take(&mut self.pending);
                let text = String::from_utf8(raw)
                    .map_err(|_| Error::Protocol("control line is not valid UTF-8".into()))?;
                return Ok(Some(text.trim_end().to_string()));
            }
            if self.pending.len() > max_bytes {
                self.pending.clear();
                return Err(Error::Protocol(format!("control line exceeds {} bytes", max_bytes)));
            }

            let limit = (max_bytes + 1 - self.pending.len()) as u64;
            let n = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(lost)?;

            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                self.pending.clear();
                return Err(Error::ConnectionLost("peer closed mid-line".into()));
            }
        }
    }

    /// `recv_line` bounded by an idle deadline. Expiry counts as a lost
    /// connection; `None` waits forever.
    pub async fn recv_line_within(
        &mut self,
        max_bytes: usize,
        idle: Option<Duration>,
    ) -> Result<Option<String>> {
        match idle {
            Some(limit) => tokio::time::timeout(limit, self.recv_line(max_bytes))
                .await
                .map_err(|_| Error::ConnectionLost(format!("idle for {:?}", limit)))?,
            None => self.recv_line(max_bytes).await,
        }
    }

    /// Write the whole buffer, retrying short writes until every byte is
    /// accepted.
    pub async fn send_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf).await.map_err(lost)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await.map_err(lost)
    }

    /// Fill `buf` completely, across as many reads as needed.
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ConnectionLost(
                format!("peer closed before {} bytes arrived", buf.len()),
            )),
            Err(e) => Err(lost(e)),
        }
    }

    /// Shut down the write side so the peer sees end of stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.map_err(lost)
    }
}

fn lost(e: std::io::Error) -> Error {
    Error::ConnectionLost(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split};

    fn pair() -> (
        Channel<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        Channel<tokio::io::ReadHalf<tokio::io::DuplexStream>, tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        (Channel::new(ar, aw), Channel::new(br, bw))
    }

    #[tokio::test]
    async fn test_lines_in_order() {
        let (mut a, mut b) = pair();
        a.send_line("FILE report.pdf").await.unwrap();
        a.send_line("CHAT hello there  ").await.unwrap();
        assert_eq!(b.recv_line(MAX_LINE_BYTES).await.unwrap().as_deref(), Some("FILE report.pdf"));
        assert_eq!(b.recv_line(MAX_LINE_BYTES).await.unwrap().as_deref(), Some("CHAT hello there"));
    }

    #[tokio::test]
    async fn test_line_split_across_writes() {
        let (mut a, mut b) = pair();
        a.send_bytes(b"QU").await.unwrap();
        a.flush().await.unwrap();
        let reader = tokio::spawn(async move {
            let line = b.recv_line(MAX_LINE_BYTES).await.unwrap();
            (b, line)
        });
        tokio::task::yield_now().await;
        a.send_bytes(b"IT\r\n").await.unwrap();
        a.flush().await.unwrap();
        let (_b, line) = reader.await.unwrap();
        assert_eq!(line.as_deref(), Some("QUIT"));
    }

    #[tokio::test]
    async fn test_peer_close_yields_none() {
        let (mut a, mut b) = pair();
        a.shutdown().await.unwrap();
        drop(a);
        assert!(b.recv_line(MAX_LINE_BYTES).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let (mut a, mut b) = pair();
        let writer = tokio::spawn(async move {
            let long = "x".repeat(40);
            let _ = a.send_line(&long).await;
            a
        });
        let err = b.recv_line(16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_newline_rejected_on_send() {
        let (mut a, _b) = pair();
        assert!(matches!(a.send_line("CHAT a\nQUIT").await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_payload_after_line_keeps_buffered_bytes() {
        let (mut a, mut b) = pair();
        // Line and payload land in one write, so both sit in the read buffer.
        a.send_bytes(b"OK f 5 x\nhello").await.unwrap();
        a.flush().await.unwrap();
        assert_eq!(b.recv_line(MAX_LINE_BYTES).await.unwrap().as_deref(), Some("OK f 5 x"));
        let mut buf = [0u8; 5];
        b.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_idle_deadline() {
        let (_a, mut b) = pair();
        let err = b.recv_line_within(MAX_LINE_BYTES, Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_recv_exact_short_is_connection_lost() {
        let (mut a, mut b) = pair();
        a.send_bytes(b"abc").await.unwrap();
        a.shutdown().await.unwrap();
        drop(a);
        let mut buf = [0u8; 10];
        assert!(matches!(b.recv_exact(&mut buf).await, Err(Error::ConnectionLost(_))));
    }
}
