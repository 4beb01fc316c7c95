//! Loro-backed collaborative document for the zettel editor.
//!
//! This crate provides:
//! - `ReplicatedDoc`: the replicated rich-text document with comment records
//! - `RichTextBinding`: local edits in, `RichDocument` out
//! - `Comments`: comment threads anchored by per-thread marks
//! - `DocumentSession`: all of the above wired to a collaboration session
//! - `SessionRegistry`: one live session per document

pub mod binding;
pub mod comments;
mod error;
pub mod observe;
pub mod registry;
pub mod session;
pub mod store;

pub use binding::{RichTextBinding, build_document, collect_doc_links};
pub use comments::{Author, CommentReply, CommentThread, Comments};
pub use error::CrdtError;
pub use observe::{Observers, Subscription};
pub use registry::{SessionLease, SessionRegistry};
pub use session::{DocumentSession, SessionNotice, SnapshotSource};
pub use store::{ChangeOrigin, DocChange, DocOp, ReplicatedDoc, StyledRun, random_peer_id};

// Re-export Loro types that consumers need
pub use loro::{LoroDoc, LoroValue, VersionVector};
