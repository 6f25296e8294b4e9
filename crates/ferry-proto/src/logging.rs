//! Transfer event reporting.
//!
//! Both ends of a file transfer report lifecycle events through a
//! `TransferLogger`, so a front end can show progress without the protocol
//! code knowing how it is displayed.

use std::fmt;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog<'a> {
    pub component: &'static str,
    pub file: &'a str,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Requester: metadata accepted, about to send READY
    MetadataReceived { size: u64, checksum: String },
    /// Responder: peer acknowledged with READY
    PeerReady,
    /// Responder: peer answered something other than READY
    PeerNotReady { reply: String },
    /// Bytes moved so far
    Progress { done: u64, total: u64 },
    /// Requester: chat frame arrived while waiting for a response
    ChatInterleaved { text: String },
    /// Requester: recomputed digest matches
    Verified { checksum: String },
    /// Requester: recomputed digest differs; file kept on disk
    IntegrityMismatch { expected: String, actual: String },
    /// Transfer finished
    TransferComplete { total_bytes: u64, duration_ms: u64 },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetadataReceived { size, checksum } => {
                write!(f, "metadata size={} sha256={}", size, checksum)
            }
            Self::PeerReady => write!(f, "peer_ready"),
            Self::PeerNotReady { reply } => write!(f, "peer_not_ready reply={:?}", reply),
            Self::Progress { done, total } => {
                let pct = if *total == 0 { 100.0 } else { *done as f64 * 100.0 / *total as f64 };
                write!(f, "progress {}/{} ({:.1}%)", done, total, pct)
            }
            Self::ChatInterleaved { text } => write!(f, "chat {}", text),
            Self::Verified { checksum } => write!(f, "verified sha256={}", checksum),
            Self::IntegrityMismatch { expected, actual } => {
                write!(f, "integrity_mismatch expected={} actual={}", expected, actual)
            }
            Self::TransferComplete { total_bytes, duration_ms } => {
                write!(f, "transfer_complete bytes={} duration_ms={}", total_bytes, duration_ms)
            }
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

/// Trait for transfer logging. Implementations can print to a console,
/// write to tracing, or discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog<'_>);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog<'_>) {
        match &entry.event {
            TransferEvent::IntegrityMismatch { .. }
            | TransferEvent::PeerNotReady { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(component = entry.component, file = entry.file, "{}", entry.event);
            }
            TransferEvent::Progress { .. } | TransferEvent::ChatInterleaved { .. } => {
                tracing::debug!(component = entry.component, file = entry.file, "{}", entry.event);
            }
            _ => {
                tracing::info!(component = entry.component, file = entry.file, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog<'_>) {}
}
