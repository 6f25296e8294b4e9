use std::io;

use crate::request::ReasonCode;

/// Errors produced by the ferry wire protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or unexpected line from the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Requested file does not exist under the file root.
    #[error("file not found: {0}")]
    NotFound(String),

    /// Digest of the received file differs from the declared one.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// Peer closed the connection or the stream broke mid-operation.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Server is at its connection limit.
    #[error("server at capacity ({0} connections)")]
    Capacity(usize),

    /// File name is not a single safe path segment.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// Local command misuse, never sent to the peer.
    #[error("usage: {0}")]
    Usage(&'static str),

    /// The peer answered a request with `ERROR <code>`.
    #[error("remote error: {}", .0.as_str())]
    Remote(ReasonCode),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the error means the channel itself is unusable.
    ///
    /// Socket failures are always reported as `ConnectionLost`; `Io` is local
    /// file trouble and leaves the channel in sync.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
