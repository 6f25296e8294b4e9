/// Ferry wire protocol.
///
/// A persistent, newline-framed TCP protocol carrying two things over one
/// socket:
/// - on-demand file download with a SHA-256 handshake (`FILE` / `OK` / `READY`)
/// - unsolicited server chat frames (`CHAT_FROM_SERVER`)
///
/// This crate holds everything both peers share: framing, the request and
/// response tokenizer, hashing, file roots, and the two halves of the
/// transfer session.

pub mod channel;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod request;
pub mod storage;
pub mod transfer;

// Re-export key types for convenience.
pub use channel::{Channel, MAX_LINE_BYTES, TcpChannel};
pub use error::{Error, Result};
pub use hasher::{HASH_CHUNK_SIZE, hash_file, hash_reader};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use request::{ReasonCode, Request, Response, TransferMetadata, chat_frame, chat_frame_text};
pub use storage::{FileRoot, validate_name};
pub use transfer::{ServeOutcome, TRANSFER_CHUNK_SIZE, TransferOutcome, request_file, serve_file};
