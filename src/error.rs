//! Error types for bandsox.
//!
//! One error enum covers the whole crate. Every variant maps to a CLI exit
//! code via [`Error::exit_code`]; timeouts and disconnects are ordinary
//! variants, never panics or control-flow exceptions.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by bandsox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied constraints violated; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// VM, snapshot, or id missing; never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not allowed in the VM's current state.
    #[error("operation requires state {expected}, VM is {actual}")]
    StateConflict { expected: String, actual: String },

    /// No free CIDs or ports left in the pool.
    #[error("allocator exhausted: no free {0}")]
    AllocatorExhausted(&'static str),

    /// VMM spawn/configure/start failed.
    #[error("boot failed: {0}")]
    BootFailed(String),

    /// The VMM rejected an API call after boot.
    #[error("VMM API error (HTTP {status}): {body}")]
    Vmm { status: u16, body: String },

    /// No vsock and no serial agent responded.
    #[error("agent disconnected")]
    AgentDisconnected,

    /// Deadline expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Upload/download integrity failure.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Strict exec surfaced a failing command.
    #[error("command exited with status {0}")]
    NonZeroExit(i32),

    /// Host OS I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Descriptor or wire payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invariant violation; programmer bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map an error to its CLI exit code.
    ///
    /// 0 success; 2 invalid argument; 3 not found; 4 state disallows op;
    /// 5 boot failure; 6 agent timeout; 7 allocator exhaustion; 8 VMM
    /// error; 1 everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 2,
            Error::NotFound(_) => 3,
            Error::StateConflict { .. } => 4,
            Error::BootFailed(_) => 5,
            Error::AgentDisconnected | Error::Timeout(_) => 6,
            Error::AllocatorExhausted(_) => 7,
            Error::Vmm { .. } => 8,
            _ => 1,
        }
    }

    /// Build a `StateConflict` from the expected and observed states.
    pub(crate) fn state_conflict(
        expected: impl Into<String>,
        actual: impl std::fmt::Display,
    ) -> Self {
        Error::StateConflict {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        // The CLI contract: each error kind has a stable exit code.
        assert_eq!(Error::InvalidArgument("x".into()).exit_code(), 2);
        assert_eq!(Error::NotFound("x".into()).exit_code(), 3);
        assert_eq!(Error::state_conflict("paused", "running").exit_code(), 4);
        assert_eq!(Error::BootFailed("x".into()).exit_code(), 5);
        assert_eq!(Error::AgentDisconnected.exit_code(), 6);
        assert_eq!(Error::Timeout("exec".into()).exit_code(), 6);
        assert_eq!(Error::AllocatorExhausted("vsock CIDs").exit_code(), 7);
        assert_eq!(
            Error::Vmm {
                status: 400,
                body: "bad".into()
            }
            .exit_code(),
            8
        );
        assert_eq!(Error::Internal("bug".into()).exit_code(), 1);
    }

    #[test]
    fn test_state_conflict_display() {
        let e = Error::state_conflict("stopped or failed", "running");
        assert_eq!(
            e.to_string(),
            "operation requires state stopped or failed, VM is running"
        );
    }
}
