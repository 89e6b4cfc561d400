//! Error taxonomy for the bridge.
//!
//! Two severities:
//! - **Recoverable** ([`BridgeError`], [`TransferError`], [`HandshakeError`]): returned to
//!   callers as ordinary results.
//! - **Fatal** ([`ProtocolViolation`]): the correlation invariant is broken. Detection sites
//!   return it as a value so it can be tested, but every host-facing entry point escalates
//!   it through [`fatal`].

use std::fmt;
use std::io;

use crate::bridge::Operation;

/// Message the host uses to report end of stream on a read.
pub const EOF_MESSAGE: &str = "EOF";

/// Which deadline a caller tried to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    ReadWrite,
    Read,
    Write,
}

impl fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadWrite => f.write_str("read/write"),
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Recoverable bridge errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The host has not registered a handler for this operation.
    #[error("operation not supported by host: {0}")]
    Unsupported(Operation),

    /// The host attempted the real I/O and it failed. Message is passed through verbatim.
    #[error("{0}")]
    Host(String),

    /// The connection or listener was already closed locally.
    #[error("use of closed ipc handle")]
    Closed,

    #[error("{0} deadlines not supported")]
    DeadlinesUnsupported(DeadlineKind),

    /// The host dropped the response path without answering.
    #[error("host abandoned request without responding")]
    Abandoned,
}

impl BridgeError {
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host(message.into())
    }

    /// Whether this is the host's end-of-stream report.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Host(message) if message == EOF_MESSAGE)
    }
}

impl From<BridgeError> for io::Error {
    fn from(err: BridgeError) -> Self {
        let kind = match &err {
            BridgeError::Closed => io::ErrorKind::NotConnected,
            BridgeError::Abandoned => io::ErrorKind::BrokenPipe,
            BridgeError::Unsupported(_) | BridgeError::DeadlinesUnsupported(_) => {
                io::ErrorKind::Unsupported
            }
            BridgeError::Host(_) if err.is_eof() => io::ErrorKind::UnexpectedEof,
            BridgeError::Host(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// A read or write that failed, possibly after moving some bytes.
///
/// `transferred` bytes were copied into (or accepted from) the caller's buffer before
/// the error occurred; they are valid and must not be discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error} ({transferred} bytes transferred)")]
pub struct TransferError {
    pub transferred: usize,
    #[source]
    pub error: BridgeError,
}

impl TransferError {
    pub fn new(transferred: usize, error: BridgeError) -> Self {
        Self { transferred, error }
    }
}

impl From<BridgeError> for TransferError {
    fn from(error: BridgeError) -> Self {
        Self::new(0, error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// A bridge was already installed; the second one is rejected.
    #[error("bridge already initialized")]
    AlreadyInitialized,

    /// The host shut the control channel down before (or instead of) initializing.
    #[error("bridge shut down before initialization completed")]
    ShutDown,
}

/// A response that cannot be reconciled with any outstanding request.
///
/// Never recoverable: see [`fatal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("invalid sequence {0}")]
    UnknownSequence(u64),

    #[error("sequence overlap at {0}")]
    SequenceOverlap(u64),

    #[error("invalid response type: {found} response routed to pending {expected} request")]
    ResponseShape {
        expected: Operation,
        found: Operation,
    },

    #[error("host sent undecodable payload: {0}")]
    Decode(String),

    #[error("host sent non-UTF-8 text: {0}")]
    InvalidUtf8(String),

    #[error("host reported success with invalid handle {0}")]
    InvalidHandle(i64),
}

/// Abort on a protocol violation.
///
/// Subsequent responses cannot be trusted once correlation is lost, so this logs and
/// panics rather than returning.
#[track_caller]
pub fn fatal(violation: ProtocolViolation) -> ! {
    tracing::error!(%violation, "Bridge protocol violated");
    panic!("bridge protocol violation: {violation}");
}
