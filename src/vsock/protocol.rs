//! Wire protocol between the host and the in-guest agent.
//!
//! Messages are newline-delimited JSON objects (UTF-8), modeled as tagged
//! sums so unknown tags are rejected at the boundary. File payloads follow
//! the header as binary frames:
//!
//! ```text
//! HEADER = one JSON object terminated by \n   (≤ 1 MiB)
//! BODY   = zero or more {length: u32-LE, bytes: length} frames,
//!          each ≤ 64 KiB
//! ```
//!
//! Every message carries `id` (echoed on replies) and `type`. Within one
//! connection messages are strictly ordered; across connections the
//! AgentSession correlates by `cmd_id`/`session_id`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};

/// Maximum size of a JSON header line.
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Maximum size of one binary body frame.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Hard cap for serial-transport file payloads (no streaming there).
pub const SERIAL_TRANSFER_CAP: u64 = 8 * 1024 * 1024;

/// Output stream of an exec or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Result of a `stat_file` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileStat {
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mode: Option<u32>,
    #[serde(default)]
    pub mtime: Option<u64>,
}

/// Messages sent by the guest agent.
///
/// Vsock: each arrives at the start of a fresh connection. Serial: one per
/// console line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    Ping {
        id: String,
    },
    /// First message of the agent's control connection; vsock is live from
    /// here on.
    Register {
        id: String,
        agent_version: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    /// Guest pushes a file to the host; BODY frames follow after `ready`.
    Upload {
        id: String,
        cmd_id: String,
        path: String,
        size: u64,
        checksum_md5: String,
        #[serde(default)]
        mode: Option<u32>,
    },
    /// Guest pulls a file from the host; host streams BODY frames after
    /// `ready`.
    Download {
        id: String,
        cmd_id: String,
        path: String,
    },
    /// Guest acknowledges a completed download.
    Complete {
        id: String,
        cmd_id: String,
        #[serde(default)]
        checksum_md5: Option<String>,
    },
    ExecResult {
        id: String,
        cmd_id: String,
        exit_code: i32,
        #[serde(default)]
        stdout_tail: String,
        #[serde(default)]
        stderr_tail: String,
    },
    SessionOutput {
        id: String,
        session_id: String,
        stream: StreamKind,
        data_b64: String,
    },
    SessionExit {
        id: String,
        session_id: String,
        exit_code: i32,
    },
    /// Serial-only: inline file content answering `read_file`.
    FileContent {
        id: String,
        cmd_id: String,
        data_b64: String,
        #[serde(default)]
        checksum_md5: Option<String>,
    },
    /// Serial-only: acknowledges a completed `write_file`.
    FileWritten {
        id: String,
        cmd_id: String,
    },
    DirList {
        id: String,
        cmd_id: String,
        entries: Vec<String>,
    },
    FileInfo {
        id: String,
        cmd_id: String,
        info: FileStat,
    },
    /// Agent-side failure of a pending command.
    Failed {
        id: String,
        #[serde(default)]
        cmd_id: Option<String>,
        error: String,
    },
}

impl GuestMessage {
    /// The correlation id of the pending operation this message answers,
    /// if any.
    pub fn cmd_id(&self) -> Option<&str> {
        match self {
            GuestMessage::Upload { cmd_id, .. }
            | GuestMessage::Download { cmd_id, .. }
            | GuestMessage::Complete { cmd_id, .. }
            | GuestMessage::ExecResult { cmd_id, .. }
            | GuestMessage::FileContent { cmd_id, .. }
            | GuestMessage::FileWritten { cmd_id, .. }
            | GuestMessage::DirList { cmd_id, .. }
            | GuestMessage::FileInfo { cmd_id, .. } => Some(cmd_id),
            GuestMessage::Failed { cmd_id, .. } => cmd_id.as_deref(),
            _ => None,
        }
    }
}

/// Messages sent by the host.
///
/// Replies travel back on the guest's connection; requests travel over a
/// host-initiated control connection (or the serial console).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Pong {
        id: String,
    },
    /// Transfer may proceed. Carries size/checksum when the host is the
    /// sender.
    Ready {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum_md5: Option<String>,
    },
    Success {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
    Error {
        id: String,
        code: String,
        message: String,
    },
    Exec {
        id: String,
        cmd_id: String,
        argv: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        pty: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    SessionStart {
        id: String,
        session_id: String,
        argv: Vec<String>,
        #[serde(default)]
        pty: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    SessionInput {
        id: String,
        session_id: String,
        data_b64: String,
    },
    SessionSignal {
        id: String,
        session_id: String,
        signum: i32,
    },
    SessionResize {
        id: String,
        session_id: String,
        cols: u16,
        rows: u16,
    },
    SessionKill {
        id: String,
        session_id: String,
    },
    /// Ask the guest to push `path` back via a guest-initiated `upload`.
    ReadFile {
        id: String,
        cmd_id: String,
        path: String,
    },
    /// Ask the guest to fetch the pending transfer (vsock `download`) or
    /// the inline payload (serial) and write it at `path`.
    WriteFile {
        id: String,
        cmd_id: String,
        path: String,
        size: u64,
        checksum_md5: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data_b64: Option<String>,
    },
    ListDir {
        id: String,
        cmd_id: String,
        path: String,
    },
    StatFile {
        id: String,
        cmd_id: String,
        path: String,
    },
}

/// Write one message as a JSON line.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Read one newline-terminated header line, bounded by [`MAX_HEADER_SIZE`].
///
/// Returns `None` on clean EOF before any byte.
pub fn read_header_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(Error::Internal("connection closed mid-header".into()));
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&buf[..pos]);
            reader.consume(pos + 1);
            break;
        }
        line.extend_from_slice(buf);
        let consumed = buf.len();
        reader.consume(consumed);
        if line.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidArgument("message exceeds 1 MiB".into()));
        }
    }
    if line.len() > MAX_HEADER_SIZE {
        return Err(Error::InvalidArgument("message exceeds 1 MiB".into()));
    }
    String::from_utf8(line).map(Some).map_err(|_| {
        Error::InvalidArgument("non-UTF-8 message".into())
    })
}

/// Outcome of parsing a header line into a message type.
pub enum Parsed<T> {
    Message(T),
    /// Valid JSON object, but an unknown or mistyped `type` tag. Carries
    /// the `id` for the `unsupported` error reply.
    Unsupported { id: String },
    /// Not a JSON object at all; the connection should be dropped.
    Malformed,
}

/// Parse a header line, distinguishing unknown tags from garbage.
pub fn parse_header<T: serde::de::DeserializeOwned>(line: &str) -> Parsed<T> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => return Parsed::Malformed,
    };
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value(value) {
        Ok(msg) => Parsed::Message(msg),
        Err(_) => Parsed::Unsupported { id },
    }
}

/// Write one binary body frame (u32-LE length prefix).
pub fn write_chunk<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    debug_assert!(bytes.len() <= CHUNK_SIZE);
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

/// Read one binary body frame. Returns `None` on clean EOF.
pub fn read_chunk<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    if !read_exact_or_eof(reader, &mut prefix)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > CHUNK_SIZE {
        return Err(Error::InvalidArgument(format!(
            "chunk of {} bytes exceeds the 64 KiB frame limit",
            len
        )));
    }
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(Some(bytes))
}

/// Like `read_exact`, but a clean EOF before the first byte yields `false`.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Internal("connection closed mid-frame".into()));
        }
        filled += n;
    }
    Ok(true)
}
