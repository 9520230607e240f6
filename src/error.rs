//! Error types for every protocol layer.
//!
//! Each layer reports its own enum and never swallows errors from the layer
//! below. The session wraps them in [`SessionError`] together with the phase it
//! was in, and the fleet orchestrator stores one [`TargetError`] per failed
//! server.

use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::message::RequestKind;
use crate::tcp::SessionPhase;

/// Result type alias using [`SessionError`].
pub type Result<T, E = SessionError> = std::result::Result<T, E>;

/// Framing checksum failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumError {
    /// Fewer bytes than the fixed frame header.
    #[error("frame truncated: {len} bytes, need at least {min}")]
    Truncated { len: usize, min: usize },

    /// The leading byte is not a known frame marker.
    #[error("unknown frame marker {0:#04x}")]
    UnknownMarker(u8),

    /// The one-byte modular sum did not match.
    #[error("check byte mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Mismatch { expected: u8, actual: u8 },

    /// The CRC over the body did not match.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch { expected: u16, actual: u16 },
}

/// Errors raised while splitting the inbound byte stream into frames.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    /// A length field inside the frame header cannot be right.
    #[error("malformed {marker:#04x} frame: {detail}")]
    Malformed { marker: u8, detail: String },
}

/// A validated body that does not match the layout expected for its kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected {kind} reply format: {detail}")]
    UnexpectedFormat { kind: RequestKind, detail: String },

    #[error("{kind} reply field `{field}` out of range: {value}")]
    FieldOutOfRange {
        kind: RequestKind,
        field: &'static str,
        value: String,
    },

    #[error("reply type {message_type:#06x} is not valid for {kind}")]
    UnexpectedMessage { kind: RequestKind, message_type: u16 },
}

impl DecodeError {
    pub(crate) fn format(kind: RequestKind, detail: impl Into<String>) -> Self {
        DecodeError::UnexpectedFormat {
            kind,
            detail: detail.into(),
        }
    }

    pub(crate) fn range(kind: RequestKind, field: &'static str, value: impl ToString) -> Self {
        DecodeError::FieldOutOfRange {
            kind,
            field,
            value: value.to_string(),
        }
    }

    /// The request kind whose layout did not match.
    pub fn kind(&self) -> RequestKind {
        match self {
            DecodeError::UnexpectedFormat { kind, .. }
            | DecodeError::FieldOutOfRange { kind, .. }
            | DecodeError::UnexpectedMessage { kind, .. } => *kind,
        }
    }
}

/// Byte-stream level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("connection closed by peer")]
    Closed,
}

/// Coarse failure classification used for session phases and fleet reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ConnectFailed,
    Timeout,
    Transport,
    Checksum,
    Framing,
    Decode,
    Protocol,
    Cancelled,
}

impl ErrorClass {
    /// Whether a fresh connection has a chance of succeeding.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorClass::ConnectFailed | ErrorClass::Timeout | ErrorClass::Transport
        )
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::ConnectFailed => "connect failed",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Transport => "transport",
            ErrorClass::Checksum => "checksum",
            ErrorClass::Framing => "framing",
            ErrorClass::Decode => "decode",
            ErrorClass::Protocol => "protocol",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// What went wrong inside a session.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Checksum(#[from] ChecksumError),

    #[error("malformed frame: {0}")]
    Framing(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("cannot {operation} while session is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: SessionPhase,
    },

    /// A previous exchange was abandoned before its reply was read.
    #[error("previous exchange was abandoned mid-flight; stream alignment lost")]
    Desynchronized,
}

impl From<WireError> for SessionFault {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => SessionFault::Transport(TransportError::Io(e)),
            WireError::Checksum(e) => SessionFault::Checksum(e),
            WireError::Malformed { .. } => SessionFault::Framing(err.to_string()),
        }
    }
}

impl SessionFault {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionFault::Transport(TransportError::Connect { .. }) => ErrorClass::ConnectFailed,
            SessionFault::Transport(TransportError::Timeout { .. }) => ErrorClass::Timeout,
            SessionFault::Transport(_) => ErrorClass::Transport,
            SessionFault::Checksum(_) => ErrorClass::Checksum,
            SessionFault::Framing(_) => ErrorClass::Framing,
            SessionFault::Decode(_) => ErrorClass::Decode,
            SessionFault::InvalidPhase { .. } | SessionFault::Desynchronized => {
                ErrorClass::Protocol
            }
        }
    }
}

/// A session failure together with the phase the session was in.
///
/// The phase tells "never got to Ready" (`Unestablished`/`Handshaking`) apart
/// from "failed mid-query" (`Ready`).
#[derive(Debug, Error)]
#[error("{fault} (while {phase})")]
pub struct SessionError {
    pub phase: SessionPhase,
    #[source]
    pub fault: SessionFault,
}

impl SessionError {
    pub fn new(phase: SessionPhase, fault: impl Into<SessionFault>) -> Self {
        Self {
            phase,
            fault: fault.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.fault.class()
    }

    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }

    /// True when the failure happened before the handshake completed.
    pub fn before_ready(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Unestablished | SessionPhase::Handshaking
        )
    }
}

/// Per-target failure recorded in a fleet result.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("fleet run cancelled before this target finished")]
    Cancelled,
}

impl TargetError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TargetError::Session(e) => e.class(),
            TargetError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Fleet configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server target `{0}`: expected port@host")]
    Target(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
