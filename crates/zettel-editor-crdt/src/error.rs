//! Error types for replicated document operations.

use std::ops::Range;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

/// Errors that can occur while editing or syncing a replicated document.
///
/// A failed call never leaves a partial edit behind.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CrdtError {
    /// Remote bytes could not be decoded. State is untouched.
    #[error("malformed update: {0}")]
    #[diagnostic(code(zettel::crdt::malformed_update))]
    MalformedUpdate(String),

    #[error("comment thread not found: {0}")]
    #[diagnostic(code(zettel::crdt::thread_not_found))]
    ThreadNotFound(SmolStr),

    #[error("document is read-only")]
    #[diagnostic(code(zettel::crdt::read_only))]
    ReadOnly,

    #[error("range {range:?} out of bounds for length {len}")]
    #[diagnostic(code(zettel::crdt::invalid_range))]
    InvalidRange { range: Range<usize>, len: usize },

    #[error("heading level {0} is outside 1-6")]
    #[diagnostic(code(zettel::crdt::invalid_heading))]
    InvalidHeading(u8),

    #[error("a session for document {0} is already open")]
    #[diagnostic(
        code(zettel::crdt::already_open),
        help("close the existing session before opening another")
    )]
    AlreadyOpen(SmolStr),

    #[error("session closed")]
    #[diagnostic(code(zettel::crdt::session_closed))]
    SessionClosed,

    /// Loading the persisted snapshot failed.
    #[error("failed to load snapshot")]
    #[diagnostic(code(zettel::crdt::snapshot))]
    Snapshot(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failed to export CRDT data.
    #[error("failed to export CRDT data: {0}")]
    Export(String),

    /// Loro CRDT error.
    #[error("loro error: {0}")]
    Loro(String),
}

impl From<loro::LoroError> for CrdtError {
    fn from(e: loro::LoroError) -> Self {
        CrdtError::Loro(e.to_string())
    }
}

impl From<loro::LoroEncodeError> for CrdtError {
    fn from(e: loro::LoroEncodeError) -> Self {
        CrdtError::Export(e.to_string())
    }
}

impl From<serde_json::Error> for CrdtError {
    fn from(e: serde_json::Error) -> Self {
        CrdtError::Serialization(e.to_string())
    }
}

impl From<zettel_common::transport::SessionError> for CrdtError {
    fn from(_: zettel_common::transport::SessionError) -> Self {
        CrdtError::SessionClosed
    }
}
