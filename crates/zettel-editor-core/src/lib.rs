//! zettel-editor-core: Pure Rust rich-text model without framework or CRDT dependencies.
//!
//! This crate provides:
//! - `RichDocument` - the structured block/inline tree the editor renders
//! - `Selection` and `EditInfo` - cursor and edit bookkeeping
//! - HTML rendering and deterministic Markdown export
//! - `RenderCache` - block-level change detection for incremental UI updates
//! - `LinkTrigger` - `[[query]]` link-autocomplete detection

pub mod link_trigger;
pub mod markdown;
pub mod model;
pub mod render;
pub mod render_cache;
pub mod types;

pub use link_trigger::{LOOKBACK_WINDOW, LinkTrigger, PendingLink, ResolutionToken};
pub use markdown::{document_to_markdown, to_markdown};
pub use model::{
    Block, BlockKind, DocLinkAttrs, Inline, InlineStyle, Mark, OBJECT_REPLACEMENT, RichDocument,
};
pub use render::{LinkTargetValidator, render_block, render_html, render_html_with};
pub use render_cache::{CachedBlock, RenderCache, RenderDiff, hash_block, make_block_id};
pub use smol_str::SmolStr;
pub use types::{EditInfo, Selection};
