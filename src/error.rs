//! Unified error handling for the ESL client runtime
//!
//! Mirrors the flat, `thiserror`-derived error enum the rest of the
//! ApoloBilling codebase uses, trimmed to the failure modes that belong to
//! the wire protocol and connection lifecycle. HTTP/response mapping is a
//! web-layer concern and stays out of this crate.

use thiserror::Error;

/// Errors produced by the ESL client runtime
#[derive(Error, Debug)]
pub enum EslError {
    // ==================== Protocol errors ====================
    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("unexpected end of stream while reading a frame")]
    UnexpectedEof,

    #[error("invalid Content-Length value: {0}")]
    InvalidContentLength(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    // ==================== Auth errors ====================
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    // ==================== Command errors ====================
    #[error("command failed: {reply_text}")]
    CommandError { reply_text: String },

    #[error("bgapi reply is missing the Job-UUID header")]
    MissingJobUuid,

    // ==================== Timing errors ====================
    #[error("command timed out")]
    Timeout,

    // ==================== Lifecycle errors ====================
    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,

    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),

    // ==================== Transport errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EslResult<T> = Result<T, EslError>;

impl EslError {
    /// Protocol-level errors are fatal for the owning connection; everything
    /// else (timeouts, command failures, duplicate job ids) is recoverable
    /// and scoped to the call that produced it. `UnsupportedContentType` is
    /// explicitly warn-only and never reaches this check — the frame is
    /// still delivered as `ContentType::Unknown`.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            EslError::MalformedHeader(_)
                | EslError::UnexpectedEof
                | EslError::InvalidContentLength(_)
                | EslError::Io(_)
        )
    }
}
