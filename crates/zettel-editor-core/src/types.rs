//! Core editor types: selection ranges and edit tracking.
//!
//! These types are framework-agnostic and shared by the CRDT binding and the
//! presence layer.

use std::ops::Range;

/// Text selection with anchor and head positions.
///
/// The anchor is where the selection started, the head is where the cursor is now.
/// They may be in any order - use `start()` and `end()` for ordered bounds.
/// All offsets are in Unicode scalar values (chars).
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash)]
pub struct Selection {
    /// Where selection started
    pub anchor: usize,
    /// Where cursor is now
    pub head: usize,
}

impl Selection {
    /// Create a new selection.
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    /// Create a collapsed selection (cursor position).
    pub fn collapsed(offset: usize) -> Self {
        Self {
            anchor: offset,
            head: offset,
        }
    }

    /// Get the start (lower bound) of the selection.
    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    /// Get the end (upper bound) of the selection.
    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }

    /// Check if the selection is collapsed (empty, cursor only).
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }

}

impl From<Range<usize>> for Selection {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// Information about the most recent local edit.
///
/// The binding records this after each accepted edit so callers can place
/// the cursor and decide whether block boundaries moved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditInfo {
    /// Character offset where the edit occurred
    pub edit_char_pos: usize,
    /// Number of characters inserted
    pub inserted_len: usize,
    /// Number of characters deleted
    pub deleted_len: usize,
    /// Whether the edit inserted or removed a line terminator
    pub contains_newline: bool,
    /// Document length (in chars) after this edit was applied.
    pub doc_len_after: usize,
}

impl EditInfo {
    /// Check if this edit info is stale (doc has changed since this edit).
    pub fn is_stale(&self, current_doc_len: usize) -> bool {
        self.doc_len_after != current_doc_len
    }

    /// Cursor position right after the edit.
    pub fn cursor_after(&self) -> usize {
        self.edit_char_pos + self.inserted_len
    }

    /// Get the range that was affected by this edit.
    ///
    /// For insertions: the range of inserted text.
    /// For deletions: an empty range at the deletion point.
    pub fn affected_range(&self) -> Range<usize> {
        self.edit_char_pos..self.edit_char_pos + self.inserted_len
    }
}
