//! # Error Taxonomy
//!
//! Purpose: One error type shared by the codec, the converter, and the
//! client engine so every failure can be classified by kind.
//!
//! ## Design Principles
//! 1. **Distinguishable Kinds**: `ErrorKind` lets callers branch on the class
//!    of failure (retry, fail fast, degrade) without matching payloads.
//! 2. **Connection Fate Is Explicit**: `is_connection_fatal` decides whether the
//!    connection that produced an error may be reused.
//! 3. **No Hidden Retries**: errors describe what happened; retry policy is the
//!    caller's business.

use thiserror::Error;

use crate::result_type::ResultType;

/// Result type alias used across the workspace.
pub type RkvResult<T> = std::result::Result<T, RkvError>;

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum RkvError {
    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bytes on the wire; the connection is out of sync.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No reply arrived before the deadline. The command may or may not have
    /// been applied by the server.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The caller's cancellation token fired while a reply was outstanding.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection was already unusable when the call started.
    #[error("connection is broken")]
    Broken,

    // -------------------------------------------------------------------------
    // Replies
    // -------------------------------------------------------------------------
    /// The server answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The reply shape did not match the declared result type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The result type flags do not describe any decoding strategy.
    #[error("unsupported result type: {0}")]
    UnsupportedResultType(ResultType),

    // -------------------------------------------------------------------------
    // Pool / configuration
    // -------------------------------------------------------------------------
    /// No connection could be handed out.
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Fieldless discriminant of [`RkvError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Protocol,
    Timeout,
    Cancelled,
    Broken,
    Server,
    Decode,
    UnsupportedResultType,
    PoolExhausted,
    Config,
}

impl RkvError {
    /// Returns the failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RkvError::Io(_) => ErrorKind::Io,
            RkvError::Protocol(_) => ErrorKind::Protocol,
            RkvError::Timeout => ErrorKind::Timeout,
            RkvError::Cancelled => ErrorKind::Cancelled,
            RkvError::Broken => ErrorKind::Broken,
            RkvError::Server(_) => ErrorKind::Server,
            RkvError::Decode(_) => ErrorKind::Decode,
            RkvError::UnsupportedResultType(_) => ErrorKind::UnsupportedResultType,
            RkvError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            RkvError::Config(_) => ErrorKind::Config,
        }
    }

    /// Returns true when the connection that produced this error must not be
    /// handed out again.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Io
                | ErrorKind::Protocol
                | ErrorKind::Timeout
                | ErrorKind::Cancelled
                | ErrorKind::Broken
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        RkvError::Protocol(message.into())
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        RkvError::Decode(message.into())
    }
}
