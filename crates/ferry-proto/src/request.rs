//! Control-line tokenizer.
//!
//! ```text
//! client → server   FILE <name> | CHAT <text> | QUIT | READY
//! server → client   OK <name> <size> <sha256> | ERROR <reason> | CHAT_FROM_SERVER <text>
//! ```

use std::fmt;

use crate::error::{Error, Result};
use crate::hasher::is_hex_digest;

pub const CMD_QUIT: &str = "QUIT";
pub const CMD_FILE: &str = "FILE";
pub const CMD_CHAT: &str = "CHAT";
pub const CMD_READY: &str = "READY";
pub const CMD_CANCEL: &str = "CANCEL";
pub const RESP_OK: &str = "OK";
pub const RESP_ERROR: &str = "ERROR";
pub const RESP_CHAT: &str = "CHAT_FROM_SERVER";

/// A client-issued command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Quit,
    File(String),
    Chat(String),
    /// `FILE` with nothing after it.
    MissingFilename,
    Unknown(String),
}

impl Request {
    /// Split on the first whitespace run; the command token is matched
    /// case-insensitively.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        match cmd.to_ascii_uppercase().as_str() {
            CMD_QUIT => Request::Quit,
            CMD_FILE if rest.is_empty() => Request::MissingFilename,
            CMD_FILE => Request::File(rest.to_string()),
            CMD_CHAT => Request::Chat(rest.to_string()),
            _ => Request::Unknown(cmd.to_string()),
        }
    }

    /// Wire form of the request.
    pub fn to_line(&self) -> String {
        match self {
            Request::Quit => CMD_QUIT.to_string(),
            Request::File(name) => format!("{} {}", CMD_FILE, name),
            Request::Chat(text) => format!("{} {}", CMD_CHAT, text),
            Request::MissingFilename => CMD_FILE.to_string(),
            Request::Unknown(cmd) => cmd.clone(),
        }
    }

    /// Parse a line typed by the local operator. Usage errors stay local
    /// and are never turned into a request for the peer.
    pub fn from_user_input(line: &str) -> Result<Self> {
        match Request::parse(line) {
            Request::MissingFilename => Err(Error::Usage("FILE <name>")),
            Request::Chat(text) if text.is_empty() => Err(Error::Usage("CHAT <message>")),
            req => Ok(req),
        }
    }
}

/// Fixed vocabulary explaining why a request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReasonCode {
    NotFound,
    HashFailure,
    SendFailure,
    MissingFilename,
    UnknownCommand,
    Other(String),
}

impl ReasonCode {
    pub fn as_str(&self) -> &str {
        match self {
            ReasonCode::NotFound => "not-found",
            ReasonCode::HashFailure => "hash-failure",
            ReasonCode::SendFailure => "send-failure",
            ReasonCode::MissingFilename => "missing-filename",
            ReasonCode::UnknownCommand => "unknown-command",
            ReasonCode::Other(code) => code,
        }
    }

    pub fn parse(code: &str) -> Self {
        match code {
            "not-found" => ReasonCode::NotFound,
            "hash-failure" => ReasonCode::HashFailure,
            "send-failure" => ReasonCode::SendFailure,
            "missing-filename" => ReasonCode::MissingFilename,
            "unknown-command" => ReasonCode::UnknownCommand,
            other => ReasonCode::Other(other.to_string()),
        }
    }

    /// Human-readable explanation for the requesting operator.
    pub fn user_message(&self) -> String {
        match self {
            ReasonCode::NotFound => "file not found on the server".into(),
            ReasonCode::HashFailure => "server failed to compute the file checksum".into(),
            ReasonCode::SendFailure => "server failed while sending the file".into(),
            ReasonCode::MissingFilename => "a file name is required".into(),
            ReasonCode::UnknownCommand => "server did not recognise the command".into(),
            ReasonCode::Other(code) => format!("server error: {}", code),
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the responder promises to send. Never revised mid-transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
    pub checksum: String,
}

/// Server answer to `FILE <name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(TransferMetadata),
    Error(ReasonCode),
}

impl Response {
    pub fn to_line(&self) -> String {
        match self {
            Response::Ok(meta) => {
                format!("{} {} {} {}", RESP_OK, meta.name, meta.size, meta.checksum)
            }
            Response::Error(code) => format!("{} {}", RESP_ERROR, code),
        }
    }

    /// Parse a file-request response. Anything short of a complete, well-typed
    /// `OK` or `ERROR` line is a protocol error.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [RESP_ERROR, code, ..] => Ok(Response::Error(ReasonCode::parse(code))),
            [RESP_ERROR] => Ok(Response::Error(ReasonCode::Other(String::new()))),
            [RESP_OK, name, size, checksum] => {
                let size = size
                    .parse::<u64>()
                    .map_err(|_| Error::Protocol(format!("non-numeric size {:?}", size)))?;
                if !is_hex_digest(checksum) {
                    return Err(Error::Protocol(format!("malformed checksum {:?}", checksum)));
                }
                Ok(Response::Ok(TransferMetadata {
                    name: name.to_string(),
                    size,
                    checksum: checksum.to_ascii_lowercase(),
                }))
            }
            [RESP_OK, ..] => Err(Error::Protocol(format!(
                "expected 4 tokens in OK response, got {}",
                tokens.len()
            ))),
            _ => Err(Error::Protocol(format!(
                "unexpected response {:?}",
                line.chars().take(80).collect::<String>()
            ))),
        }
    }
}

/// Extract the text of an unsolicited chat frame, if `line` is one.
pub fn chat_frame_text(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(RESP_CHAT)?;
    if rest.is_empty() {
        return Some("");
    }
    rest.strip_prefix(char::is_whitespace).map(str::trim_start)
}

/// Wire form of a chat frame.
pub fn chat_frame(text: &str) -> String {
    format!("{} {}", RESP_CHAT, text)
}
