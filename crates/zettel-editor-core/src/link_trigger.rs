//! Detection of typed `[[query]]` link triggers.
//!
//! The host feeds the trigger the text just before the cursor after every
//! keystroke. When that text ends in a complete `[[query]]`, the trigger hands
//! out a [`PendingLink`] stamped with a generation token. Resolving the query
//! (searching for a target document) is asynchronous; any later keystroke or
//! an explicit [`LinkTrigger::cancel`] bumps the generation, and a resolution
//! carrying an older token must be dropped.

use std::ops::Range;

/// Max chars before the cursor scanned for a trigger.
pub const LOOKBACK_WINDOW: usize = 64;

/// Generation stamp of a pending link resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResolutionToken(u64);

impl ResolutionToken {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// A completed `[[query]]` waiting for target resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingLink {
    pub token: ResolutionToken,
    /// Text between the brackets, trimmed.
    pub query: String,
    /// Char range of the whole `[[query]]` in the document.
    pub range: Range<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
    Text,
    /// Saw one `[` at the given window index.
    OneOpen(usize),
    /// Inside `[[`, started at the given window index.
    Query { start: usize },
    /// Saw the first `]` of the closing pair.
    OneClose { start: usize },
    /// Complete trigger spanning `start..end`.
    Closed { start: usize, end: usize },
}

impl ScanState {
    fn step(self, index: usize, c: char) -> ScanState {
        match (self, c) {
            (_, '\n') => ScanState::Text,
            (ScanState::OneOpen(start), '[') => ScanState::Query { start },
            (ScanState::Query { start }, '[') if index == start + 2 => {
                // `[[[`: slide the opening pair forward.
                ScanState::Query { start: start + 1 }
            }
            (ScanState::Query { start }, ']') => ScanState::OneClose { start },
            (ScanState::OneClose { start }, ']') => ScanState::Closed {
                start,
                end: index + 1,
            },
            (ScanState::OneClose { .. }, _) => ScanState::Text.step(index, c),
            (ScanState::Query { .. }, '[') => ScanState::OneOpen(index),
            (ScanState::Query { start }, _) => ScanState::Query { start },
            (_, '[') => ScanState::OneOpen(index),
            _ => ScanState::Text,
        }
    }
}

/// Scan a window of chars for a trigger ending at the last char.
///
/// Returns the window-relative char range and the trimmed query.
fn scan(window: &[char]) -> Option<(Range<usize>, String)> {
    let state = window
        .iter()
        .enumerate()
        .fold(ScanState::Text, |state, (i, c)| state.step(i, *c));
    match state {
        ScanState::Closed { start, end } if end == window.len() => {
            let query: String = window[start + 2..end - 2].iter().collect();
            let query = query.trim();
            (!query.is_empty()).then(|| (start..end, query.to_string()))
        }
        _ => None,
    }
}

/// Link-autocomplete trigger state.
#[derive(Clone, Debug, Default)]
pub struct LinkTrigger {
    generation: u64,
    pending: Option<PendingLink>,
}

impl LinkTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the text preceding the cursor.
    ///
    /// `text_start` is the char offset of `text_before_cursor` in the document.
    /// Every call invalidates previously issued tokens.
    pub fn on_text_changed(
        &mut self,
        text_before_cursor: &str,
        text_start: usize,
    ) -> Option<PendingLink> {
        self.generation += 1;
        self.pending = None;

        let chars: Vec<char> = text_before_cursor.chars().collect();
        let skip = chars.len().saturating_sub(LOOKBACK_WINDOW);
        let window = &chars[skip..];
        let (range, query) = scan(window)?;

        let offset = text_start + skip;
        let pending = PendingLink {
            token: ResolutionToken(self.generation),
            query,
            range: offset + range.start..offset + range.end,
        };
        tracing::debug!(query = %pending.query, generation = self.generation, "link trigger");
        self.pending = Some(pending.clone());
        Some(pending)
    }

    /// Drop the pending trigger and invalidate outstanding tokens.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.pending = None;
    }

    pub fn pending(&self) -> Option<&PendingLink> {
        self.pending.as_ref()
    }

    pub fn is_current(&self, token: ResolutionToken) -> bool {
        token.0 == self.generation && self.pending.is_some()
    }

    /// Take the pending trigger if `token` is still the latest one.
    pub fn take_if_current(&mut self, token: ResolutionToken) -> Option<PendingLink> {
        if self.is_current(token) {
            self.pending.take()
        } else {
            None
        }
    }
}
