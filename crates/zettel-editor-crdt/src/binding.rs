//! Binding between the replicated character sequence and the rich-text tree.
//!
//! Local edits are turned into store ops here; [`RichTextBinding::render`]
//! rebuilds the [`RichDocument`] from the current attribute runs.

use std::cell::RefCell;
use std::collections::HashSet;
use std::ops::Range;
use std::rc::Rc;

use loro::LoroValue;
use smol_str::SmolStr;
use tracing::debug;
use zettel_editor_core::{
    Block, BlockKind, DocLinkAttrs, EditInfo, Inline, InlineStyle, LOOKBACK_WINDOW,
    LinkTargetValidator, LinkTrigger, Mark, OBJECT_REPLACEMENT, PendingLink, RenderCache,
    RenderDiff, ResolutionToken, RichDocument, document_to_markdown,
};

use crate::CrdtError;
use crate::comments::live_thread_ids;
use crate::store::{
    BLOCK_KEY, BOLD_KEY, CODE_KEY, COMMENT_KEY_PREFIX, DOCLINK_KEY, DocOp, ITALIC_KEY, LINK_KEY,
    ReplicatedDoc, StyledRun, mark_is_set, value_str,
};

fn mark_entry(mark: &Mark) -> (&'static str, LoroValue) {
    match mark {
        Mark::Bold => (BOLD_KEY, true.into()),
        Mark::Italic => (ITALIC_KEY, true.into()),
        Mark::Code => (CODE_KEY, true.into()),
        Mark::Link { href } => (LINK_KEY, href.as_str().into()),
    }
}

fn block_op(terminator: usize, kind: BlockKind) -> DocOp {
    let range = terminator..terminator + 1;
    match kind.as_attr() {
        Some(attr) => DocOp::Mark {
            range,
            key: BLOCK_KEY.into(),
            value: attr.as_str().into(),
        },
        None => DocOp::Unmark {
            range,
            key: BLOCK_KEY.into(),
        },
    }
}

fn inline_style(run: &StyledRun, live: &HashSet<SmolStr>) -> InlineStyle {
    InlineStyle {
        bold: run.attr(BOLD_KEY).is_some(),
        italic: run.attr(ITALIC_KEY).is_some(),
        code: run.attr(CODE_KEY).is_some(),
        link: run.attr(LINK_KEY).and_then(value_str).map(SmolStr::new),
        comments: run
            .attrs
            .iter()
            .filter(|(_, value)| mark_is_set(value))
            .filter_map(|(key, _)| key.strip_prefix(COMMENT_KEY_PREFIX))
            .filter(|id| live.contains(*id))
            .map(SmolStr::new)
            .collect(),
    }
}

/// Build the rich-text tree from attribute runs.
///
/// Comment ids not in `live` (deleted or resolved threads) are dropped.
pub fn build_document(runs: &[StyledRun], live: &HashSet<SmolStr>) -> RichDocument {
    let mut blocks = Vec::new();
    let mut current = Block::new(BlockKind::Paragraph, 0);

    for run in runs {
        let style = inline_style(run, live);
        let doclink = run
            .attr(DOCLINK_KEY)
            .and_then(value_str)
            .and_then(|json| serde_json::from_str::<DocLinkAttrs>(json).ok());

        let mut pos = run.start;
        let mut text = String::new();
        for c in run.text.chars() {
            match c {
                '\n' => {
                    if !text.is_empty() {
                        current.push(Inline::Text {
                            text: std::mem::take(&mut text),
                            style: style.clone(),
                        });
                    }
                    current.kind = run
                        .attr(BLOCK_KEY)
                        .and_then(value_str)
                        .and_then(BlockKind::from_attr)
                        .unwrap_or_default();
                    blocks.push(std::mem::replace(
                        &mut current,
                        Block::new(BlockKind::Paragraph, pos + 1),
                    ));
                }
                OBJECT_REPLACEMENT if doclink.is_some() => {
                    if !text.is_empty() {
                        current.push(Inline::Text {
                            text: std::mem::take(&mut text),
                            style: style.clone(),
                        });
                    }
                    if let Some(attrs) = &doclink {
                        current.push(Inline::DocLink {
                            attrs: attrs.clone(),
                            style: style.clone(),
                        });
                    }
                }
                _ => text.push(c),
            }
            pos += 1;
        }
        if !text.is_empty() {
            current.push(Inline::Text { text, style });
        }
    }

    // Unterminated last line.
    if !current.is_empty() {
        blocks.push(current);
    }
    RichDocument { blocks }
}

/// References currently in the document, in document order.
pub fn collect_doc_links(store: &ReplicatedDoc) -> Vec<DocLinkAttrs> {
    build_document(&store.runs(), &HashSet::new())
        .doc_links()
        .cloned()
        .collect()
}

/// Rich-text view of a replicated document.
pub struct RichTextBinding {
    store: Rc<ReplicatedDoc>,
    last_edit: RefCell<Option<EditInfo>>,
    link_trigger: RefCell<LinkTrigger>,
    render_cache: RefCell<RenderCache>,
}

impl RichTextBinding {
    pub fn new(store: Rc<ReplicatedDoc>) -> Self {
        Self {
            store,
            last_edit: RefCell::new(None),
            link_trigger: RefCell::new(LinkTrigger::new()),
            render_cache: RefCell::new(RenderCache::new()),
        }
    }

    pub fn store(&self) -> &Rc<ReplicatedDoc> {
        &self.store
    }

    /// Reject local edits. Remote changes and rendering are unaffected.
    /// Shared with every handle on the same store, [`Comments`](crate::Comments) included.
    pub fn set_read_only(&self, read_only: bool) {
        self.store.set_read_only(read_only);
    }

    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    pub fn last_edit(&self) -> Option<EditInfo> {
        self.last_edit.borrow().clone()
    }

    fn ensure_writable(&self) -> Result<(), CrdtError> {
        if self.store.is_read_only() {
            return Err(CrdtError::ReadOnly);
        }
        Ok(())
    }

    fn check_range(&self, range: &Range<usize>) -> Result<(), CrdtError> {
        let len = self.store.len();
        if range.start > range.end || range.end > len {
            return Err(CrdtError::InvalidRange {
                range: range.clone(),
                len,
            });
        }
        Ok(())
    }

    fn record_edit(&self, pos: usize, inserted_len: usize, deleted_len: usize, newline: bool) {
        *self.last_edit.borrow_mut() = Some(EditInfo {
            edit_char_pos: pos,
            inserted_len,
            deleted_len,
            contains_newline: newline,
            doc_len_after: self.store.len(),
        });
    }

    /// Block attribute on the terminator of the line containing `pos`.
    fn line_block_attr(&self, pos: usize) -> Option<LoroValue> {
        for run in self.store.runs() {
            let terminates = run
                .text
                .chars()
                .enumerate()
                .any(|(i, c)| c == '\n' && run.start + i >= pos);
            if terminates {
                return run.attr(BLOCK_KEY).cloned();
            }
        }
        None
    }

    /// Marks giving every newline in `text`, inserted at `at`, the block
    /// format of the line around `lookup`.
    fn newline_format_ops(&self, lookup: usize, at: usize, text: &str) -> Vec<DocOp> {
        if !text.contains('\n') {
            return Vec::new();
        }
        let Some(value) = self.line_block_attr(lookup) else {
            return Vec::new();
        };
        text.chars()
            .enumerate()
            .filter(|(_, c)| *c == '\n')
            .map(|(i, _)| DocOp::Mark {
                range: at + i..at + i + 1,
                key: BLOCK_KEY.into(),
                value: value.clone(),
            })
            .collect()
    }

    /// Insert plain text. U+FFFC is stripped; new lines copy the format of
    /// the line they split.
    pub fn insert_text(&self, pos: usize, text: &str) -> Result<Vec<u8>, CrdtError> {
        self.ensure_writable()?;
        self.check_range(&(pos..pos))?;
        let text: String = text.chars().filter(|c| *c != OBJECT_REPLACEMENT).collect();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut ops = self.newline_format_ops(pos, pos, &text);
        ops.insert(
            0,
            DocOp::Insert {
                pos,
                text: text.clone(),
            },
        );
        let update = self.store.apply_local(ops)?;
        self.record_edit(pos, text.chars().count(), 0, text.contains('\n'));
        Ok(update)
    }

    /// Delete a char range. A reference inside the range goes as a whole.
    pub fn delete(&self, range: Range<usize>) -> Result<Vec<u8>, CrdtError> {
        self.ensure_writable()?;
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let newline = self
            .store
            .slice(range.clone())
            .is_some_and(|s| s.contains('\n'));
        let update = self.store.apply_local(vec![DocOp::Delete {
            range: range.clone(),
        }])?;
        self.record_edit(range.start, 0, range.len(), newline);
        Ok(update)
    }

    /// Replace a range with plain text in one commit.
    pub fn replace(&self, range: Range<usize>, text: &str) -> Result<Vec<u8>, CrdtError> {
        self.ensure_writable()?;
        self.check_range(&range)?;
        let text: String = text.chars().filter(|c| *c != OBJECT_REPLACEMENT).collect();
        let removed_newline = self
            .store
            .slice(range.clone())
            .is_some_and(|s| s.contains('\n'));

        let mut ops = Vec::new();
        if !range.is_empty() {
            ops.push(DocOp::Delete {
                range: range.clone(),
            });
        }
        if !text.is_empty() {
            ops.push(DocOp::Insert {
                pos: range.start,
                text: text.clone(),
            });
            // The line that survives the delete is the one ending after `range.end`.
            ops.extend(self.newline_format_ops(range.end, range.start, &text));
        }
        let update = self.store.apply_local(ops)?;
        self.record_edit(
            range.start,
            text.chars().count(),
            range.len(),
            removed_newline || text.contains('\n'),
        );
        Ok(update)
    }

    /// Apply `mark` over the range, or remove it if the whole range has it.
    pub fn toggle_mark(&self, range: Range<usize>, mark: &Mark) -> Result<Vec<u8>, CrdtError> {
        self.ensure_writable()?;
        self.check_range(&range)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let (key, value) = mark_entry(mark);

        let fully_marked = self
            .store
            .runs()
            .iter()
            .filter(|run| {
                let r = run.range();
                r.start < range.end && r.end > range.start
            })
            .all(|run| run.attr(key) == Some(&value));

        let op = if fully_marked {
            DocOp::Unmark {
                range,
                key: key.into(),
            }
        } else {
            DocOp::Mark {
                range,
                key: key.into(),
                value,
            }
        };
        self.store.apply_local(vec![op])
    }

    /// Set the block format of every line touched by `range`.
    ///
    /// An unterminated final line gets a terminator appended.
    pub fn set_block(&self, range: Range<usize>, kind: BlockKind) -> Result<Vec<u8>, CrdtError> {
        self.ensure_writable()?;
        self.check_range(&range)?;
        if let (BlockKind::Heading(level), false) = (kind, kind.is_valid()) {
            return Err(CrdtError::InvalidHeading(level));
        }
        let chars: Vec<char> = self.store.text().chars().collect();

        let mut ops = Vec::new();
        let mut line_start = range.start;
        loop {
            match chars[line_start..].iter().position(|c| *c == '\n') {
                Some(offset) => {
                    let terminator = line_start + offset;
                    ops.push(block_op(terminator, kind));
                    if terminator + 1 >= range.end {
                        break;
                    }
                    line_start = terminator + 1;
                }
                None => {
                    if kind != BlockKind::Paragraph {
                        ops.push(DocOp::Insert {
                            pos: chars.len(),
                            text: "\n".into(),
                        });
                        ops.push(block_op(chars.len(), kind));
                    }
                    break;
                }
            }
        }
        self.store.apply_local(ops)
    }

    /// Insert an atomic reference at `pos`.
    pub fn insert_doc_link(&self, pos: usize, attrs: &DocLinkAttrs) -> Result<Vec<u8>, CrdtError> {
        self.ensure_writable()?;
        self.check_range(&(pos..pos))?;
        let ops = doc_link_ops(pos, attrs)?;
        let update = self.store.apply_local(ops)?;
        self.record_edit(pos, 1, 0, false);
        Ok(update)
    }

    /// Feed the link trigger the text before `cursor` after a keystroke.
    pub fn check_link_trigger(&self, cursor: usize) -> Option<PendingLink> {
        let start = cursor.saturating_sub(LOOKBACK_WINDOW);
        let Some(window) = self.store.slice(start..cursor) else {
            self.link_trigger.borrow_mut().cancel();
            return None;
        };
        self.link_trigger.borrow_mut().on_text_changed(&window, start)
    }

    pub fn cancel_link_trigger(&self) {
        self.link_trigger.borrow_mut().cancel();
    }

    pub fn pending_link(&self) -> Option<PendingLink> {
        self.link_trigger.borrow().pending().cloned()
    }

    /// Replace the typed `[[query]]` with a reference to the resolved target.
    ///
    /// Returns `None` when the resolution is stale: a newer keystroke or
    /// cancel happened, or the typed text changed in the meantime.
    pub fn complete_link(
        &self,
        token: ResolutionToken,
        attrs: &DocLinkAttrs,
    ) -> Result<Option<Vec<u8>>, CrdtError> {
        self.ensure_writable()?;
        let Some(pending) = self.link_trigger.borrow_mut().take_if_current(token) else {
            debug!(generation = token.generation(), "stale link resolution dropped");
            return Ok(None);
        };

        let typed = self.store.slice(pending.range.clone());
        let query = typed
            .as_deref()
            .and_then(|t| t.strip_prefix("[["))
            .and_then(|t| t.strip_suffix("]]"))
            .map(str::trim);
        if query != Some(pending.query.as_str()) {
            debug!(query = %pending.query, "link text changed before resolution");
            return Ok(None);
        }

        let start = pending.range.start;
        let mut ops = vec![DocOp::Delete {
            range: pending.range.clone(),
        }];
        ops.extend(doc_link_ops(start, attrs)?);
        let update = self.store.apply_local(ops)?;
        self.record_edit(start, 1, pending.range.len(), false);
        Ok(Some(update))
    }

    /// Rebuild the rich-text tree.
    pub fn render(&self) -> RichDocument {
        build_document(&self.store.runs(), &live_thread_ids(&self.store))
    }

    /// Re-render into the block cache. Unchanged blocks keep their HTML.
    pub fn refresh<V: LinkTargetValidator>(&self, validator: &V) -> RenderDiff {
        let doc = self.render();
        self.render_cache.borrow_mut().update(&doc, validator)
    }

    /// HTML as of the last [`refresh`](Self::refresh).
    pub fn cached_html(&self) -> String {
        self.render_cache.borrow().html()
    }

    pub fn doc_links(&self) -> Vec<DocLinkAttrs> {
        collect_doc_links(&self.store)
    }

    pub fn to_markdown(&self) -> String {
        document_to_markdown(&self.render())
    }
}

fn doc_link_ops(pos: usize, attrs: &DocLinkAttrs) -> Result<Vec<DocOp>, CrdtError> {
    let json = serde_json::to_string(attrs)?;
    Ok(vec![
        DocOp::Insert {
            pos,
            text: OBJECT_REPLACEMENT.to_string(),
        },
        DocOp::Mark {
            range: pos..pos + 1,
            key: DOCLINK_KEY.into(),
            value: json.into(),
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::{Author, Comments};

    fn binding(text: &str) -> RichTextBinding {
        let binding = RichTextBinding::new(Rc::new(ReplicatedDoc::with_peer(3).unwrap()));
        binding.insert_text(0, text).unwrap();
        binding
    }

    fn kinds(doc: &RichDocument) -> Vec<BlockKind> {
        doc.blocks.iter().map(|b| b.kind).collect()
    }

    #[test]
    fn refresh_reports_only_edited_blocks() {
        let b = binding("one\ntwo\nthree");
        let first = b.refresh(&());
        assert_eq!(first.changed, [0, 1, 2]);

        b.insert_text(4, "2 ").unwrap();
        let diff = b.refresh(&());
        assert_eq!(diff.changed, [1]);
        assert_eq!(diff.removed, 0);
        assert_eq!(b.cached_html(), "<p>one</p><p>2 two</p><p>three</p>");

        b.delete(3..9).unwrap();
        let diff = b.refresh(&());
        assert_eq!(diff.changed, [1]);
        assert_eq!(diff.removed, 1);
        assert!(b.refresh(&()).is_empty());
    }

    #[test]
    fn renders_blocks_from_terminators() {
        let b = binding("Title\nbody text");
        b.set_block(0..0, BlockKind::Heading(1)).unwrap();

        let doc = b.render();
        assert_eq!(kinds(&doc), [BlockKind::Heading(1), BlockKind::Paragraph]);
        assert_eq!(doc.blocks[0].plain_text(), "Title");
        assert_eq!(doc.blocks[1].plain_text(), "body text");
        assert_eq!(doc.blocks[1].char_range, 6..15);
    }

    #[test]
    fn set_block_on_last_line_appends_terminator() {
        let b = binding("item");
        b.set_block(0..4, BlockKind::BulletItem).unwrap();
        assert_eq!(b.store().text(), "item\n");
        assert_eq!(kinds(&b.render()), [BlockKind::BulletItem]);
    }

    #[test]
    fn newline_inside_list_item_copies_format() {
        let b = binding("one");
        b.set_block(0..0, BlockKind::BulletItem).unwrap();
        b.insert_text(3, "\ntwo").unwrap();

        assert_eq!(b.store().text(), "one\ntwo\n");
        let doc = b.render();
        assert_eq!(kinds(&doc), [BlockKind::BulletItem, BlockKind::BulletItem]);
        assert_eq!(b.to_markdown(), "- one\n- two");
    }

    #[test]
    fn toggle_mark_applies_then_removes() {
        let b = binding("make this bold");
        b.toggle_mark(5..9, &Mark::Bold).unwrap();
        let doc = b.render();
        let bold: Vec<String> = doc.blocks[0]
            .inlines
            .iter()
            .filter(|i| i.style().bold)
            .map(|i| match i {
                Inline::Text { text, .. } => text.clone(),
                Inline::DocLink { .. } => String::new(),
            })
            .collect();
        assert_eq!(bold, ["this"]);

        b.toggle_mark(5..9, &Mark::Bold).unwrap();
        assert!(b.render().blocks[0].inlines.iter().all(|i| !i.style().bold));
    }

    #[test]
    fn doc_link_is_one_atomic_char() {
        let b = binding("see  now");
        b.insert_doc_link(4, &DocLinkAttrs::new("n-42", "Other note"))
            .unwrap();
        assert_eq!(b.store().len(), 9);
        assert_eq!(b.render().plain_text(), "see Other note now");

        // A range touching only the reference's position removes it whole.
        b.delete(4..5).unwrap();
        assert_eq!(b.store().text(), "see  now");
        assert!(b.doc_links().is_empty());
    }

    #[test]
    fn deleting_across_a_reference_removes_it() {
        let b = binding("ab");
        b.insert_doc_link(1, &DocLinkAttrs::new("x", "X")).unwrap();
        b.delete(0..2).unwrap();
        assert_eq!(b.store().text(), "b");
        assert!(b.doc_links().is_empty());
    }

    #[test]
    fn inserted_text_never_contains_object_replacement() {
        let b = binding("a\u{FFFC}b");
        assert_eq!(b.store().text(), "ab");
        assert!(b.doc_links().is_empty());
    }

    #[test]
    fn set_block_rejects_heading_levels_outside_range() {
        let b = binding("Title\n");
        let before = b.store().version();
        for level in [0, 7, 9] {
            let err = b.set_block(0..0, BlockKind::Heading(level)).unwrap_err();
            assert!(matches!(err, CrdtError::InvalidHeading(l) if l == level));
        }
        assert_eq!(b.store().version(), before);

        b.set_block(0..0, BlockKind::Heading(6)).unwrap();
        assert_eq!(b.render().blocks[0].kind, BlockKind::Heading(6));
    }

    #[test]
    fn read_only_rejects_local_edits() {
        let b = binding("text");
        b.set_read_only(true);
        assert!(matches!(b.insert_text(0, "x"), Err(CrdtError::ReadOnly)));
        assert!(matches!(b.delete(0..1), Err(CrdtError::ReadOnly)));
        assert!(matches!(
            b.toggle_mark(0..1, &Mark::Italic),
            Err(CrdtError::ReadOnly)
        ));
        assert!(matches!(
            b.set_block(0..0, BlockKind::Blockquote),
            Err(CrdtError::ReadOnly)
        ));
        assert_eq!(b.store().text(), "text");

        // Remote edits still land.
        let other = ReplicatedDoc::with_peer(9).unwrap();
        other
            .apply_remote(&b.store().snapshot().unwrap())
            .unwrap();
        let update = other
            .apply_local(vec![DocOp::Insert {
                pos: 4,
                text: "!".into(),
            }])
            .unwrap();
        b.store().apply_remote(&update).unwrap();
        assert_eq!(b.render().plain_text(), "text!");
    }

    #[test]
    fn out_of_bounds_edit_is_rejected() {
        let b = binding("abc");
        let err = b.delete(2..9).unwrap_err();
        assert!(matches!(err, CrdtError::InvalidRange { len: 3, .. }));
    }

    #[test]
    fn complete_link_replaces_typed_trigger() {
        let b = binding("see [[Daily]]");
        let pending = b.check_link_trigger(13).expect("trigger");
        assert_eq!(pending.query, "Daily");
        assert_eq!(pending.range, 4..13);

        let update = b
            .complete_link(pending.token, &DocLinkAttrs::new("d1", "Daily"))
            .unwrap();
        assert!(update.is_some());
        assert_eq!(b.store().text(), "see \u{FFFC}");
        assert_eq!(b.doc_links(), vec![DocLinkAttrs::new("d1", "Daily")]);
    }

    #[test]
    fn stale_link_resolution_is_discarded() {
        let b = binding("[[Old]]");
        let first = b.check_link_trigger(7).expect("trigger");

        b.insert_text(7, " ").unwrap();
        b.check_link_trigger(8);
        let outcome = b
            .complete_link(first.token, &DocLinkAttrs::new("o", "Old"))
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(b.store().text(), "[[Old]] ");
    }

    #[test]
    fn changed_trigger_text_is_not_replaced() {
        let b = binding("[[Old]]");
        let pending = b.check_link_trigger(7).expect("trigger");
        // An edit that bypasses the trigger, like a remote one.
        b.store()
            .apply_local(vec![DocOp::Insert {
                pos: 2,
                text: "X".into(),
            }])
            .unwrap();
        let outcome = b
            .complete_link(pending.token, &DocLinkAttrs::new("o", "Old"))
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn resolved_comment_marks_are_not_rendered() {
        let b = binding("hello world");
        let comments = Comments::new(b.store().clone());
        let author = Author::new("Ada", "#fff");
        let (id, _) = comments.add_comment("c", &author, Some(0..5)).unwrap();

        let first = &b.render().blocks[0].inlines[0];
        assert_eq!(first.style().comments, vec![id.clone()]);

        // Orphaned mark: record deleted, mark left behind.
        b.store()
            .apply_local(vec![DocOp::DeleteThread { thread: id.clone() }])
            .unwrap();
        assert_eq!(comments.anchor_ranges(&id), vec![0..5]);
        assert!(
            b.render().blocks[0]
                .inlines
                .iter()
                .all(|i| i.style().comments.is_empty())
        );
    }

    #[test]
    fn markdown_export_of_rendered_document() {
        let b = binding("Notes\nsee  and more");
        b.set_block(0..0, BlockKind::Heading(1)).unwrap();
        b.insert_doc_link(10, &DocLinkAttrs::new("n", "Other")).unwrap();
        b.toggle_mark(16..20, &Mark::Italic).unwrap();
        insta::assert_snapshot!(b.to_markdown(), @r"
        # Notes

        see Other and *more*
        ");
    }
}
