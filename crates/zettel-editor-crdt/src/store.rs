//! Loro-backed replicated document store.
//!
//! One [`ReplicatedDoc`] holds the rich-text content, the shared comment
//! records and their creation order. Local edits arrive as [`DocOp`] batches
//! that are validated against the current state before anything is applied;
//! remote edits arrive as encoded Loro updates.

use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::rc::Rc;

use loro::{
    Container, ExpandType, ExportMode, LoroDoc, LoroList, LoroMap, LoroText, LoroValue,
    StyleConfig, StyleConfigMap, TextDelta, UndoManager as LoroUndoManager, ValueOrContainer,
    VersionVector,
};
use smol_str::{SmolStr, format_smolstr};
use tracing::{debug, trace};

use crate::CrdtError;
use crate::comments::{CommentReply, CommentThread};
use crate::observe::{Observers, Subscription};

pub const TEXT_CONTAINER: &str = "content";
pub const COMMENTS_CONTAINER: &str = "comments";
pub const COMMENT_ORDER_CONTAINER: &str = "comment_order";

pub const BOLD_KEY: &str = "bold";
pub const ITALIC_KEY: &str = "italic";
pub const CODE_KEY: &str = "code";
pub const LINK_KEY: &str = "link";
/// Block format, carried by the `\n` terminating a line.
pub const BLOCK_KEY: &str = "block";
/// JSON-encoded reference attributes on a U+FFFC character.
pub const DOCLINK_KEY: &str = "doclink";
pub const COMMENT_KEY_PREFIX: &str = "comment:";

/// Mark key anchoring a comment thread.
pub fn comment_key(thread: &str) -> SmolStr {
    format_smolstr!("{COMMENT_KEY_PREFIX}{thread}")
}

/// Whether a mark value means "set". Unmarked ranges may surface as null.
pub fn mark_is_set(value: &LoroValue) -> bool {
    !matches!(value, LoroValue::Null | LoroValue::Bool(false))
}

/// String content of a value, if it is a string.
pub fn value_str(value: &LoroValue) -> Option<&str> {
    match value {
        LoroValue::String(s) => {
            let s: &str = s;
            Some(s)
        }
        _ => None,
    }
}

/// A primitive local edit.
#[derive(Clone, Debug, PartialEq)]
pub enum DocOp {
    Insert { pos: usize, text: String },
    Delete { range: Range<usize> },
    Mark {
        range: Range<usize>,
        key: SmolStr,
        value: LoroValue,
    },
    Unmark { range: Range<usize>, key: SmolStr },
    CreateThread { thread: CommentThread },
    AddReply { thread: SmolStr, reply: CommentReply },
    SetResolved { thread: SmolStr, resolved: bool },
    DeleteThread { thread: SmolStr },
}

impl DocOp {
    fn touches_text(&self) -> bool {
        matches!(
            self,
            DocOp::Insert { .. } | DocOp::Delete { .. } | DocOp::Mark { .. } | DocOp::Unmark { .. }
        )
    }

    fn touches_comments(&self) -> bool {
        match self {
            DocOp::Mark { key, .. } | DocOp::Unmark { key, .. } => {
                key.starts_with(COMMENT_KEY_PREFIX)
            }
            DocOp::CreateThread { .. }
            | DocOp::AddReply { .. }
            | DocOp::SetResolved { .. }
            | DocOp::DeleteThread { .. } => true,
            DocOp::Insert { .. } | DocOp::Delete { .. } => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// Edit made through this replica, including undo and redo.
    Local,
    /// Merged from another replica.
    Remote,
}

/// Notification sent to store observers after an accepted mutation.
#[derive(Clone, Debug)]
pub struct DocChange {
    pub origin: ChangeOrigin,
    /// Encoded update to broadcast. Empty for remote changes.
    pub update: Vec<u8>,
    /// Text content or its marks may have changed.
    pub text: bool,
    /// Comment records or anchors may have changed.
    pub comments: bool,
}

/// A run of characters sharing the same attributes.
#[derive(Clone, Debug, PartialEq)]
pub struct StyledRun {
    pub start: usize,
    pub text: String,
    pub attrs: BTreeMap<String, LoroValue>,
}

impl StyledRun {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.char_len()
    }

    /// The attribute value when it is set.
    pub fn attr(&self, key: &str) -> Option<&LoroValue> {
        self.attrs.get(key).filter(|v| mark_is_set(v))
    }
}

fn configure_styles(doc: &LoroDoc) {
    let mut styles = StyleConfigMap::new();
    for key in [BOLD_KEY, ITALIC_KEY] {
        styles.insert(
            key.into(),
            StyleConfig {
                expand: ExpandType::After,
            },
        );
    }
    for key in [CODE_KEY, LINK_KEY, BLOCK_KEY, DOCLINK_KEY] {
        styles.insert(
            key.into(),
            StyleConfig {
                expand: ExpandType::None,
            },
        );
    }
    doc.config_text_style(styles);
    // Comment keys are per thread, so they fall back to the default.
    doc.config_default_text_style(Some(StyleConfig {
        expand: ExpandType::None,
    }));
}

fn new_undo_manager(doc: &LoroDoc) -> Rc<RefCell<LoroUndoManager>> {
    let mut undo = LoroUndoManager::new(doc);
    undo.set_merge_interval(0);
    Rc::new(RefCell::new(undo))
}

/// Random non-zero replica id.
pub fn random_peer_id() -> u64 {
    rand::random_range(1..u64::MAX)
}

/// The replicated document.
///
/// Single-threaded: share it through `Rc`. Every method takes `&self`, so
/// observers may read the document while being notified.
pub struct ReplicatedDoc {
    doc: LoroDoc,
    content: LoroText,
    comments: LoroMap,
    order: LoroList,
    undo_mgr: Rc<RefCell<LoroUndoManager>>,
    observers: Observers<DocChange>,
    read_only: Cell<bool>,
}

/// What observers can see of the document, for classifying remote changes.
#[derive(PartialEq)]
struct VisibleState {
    text: String,
    /// Non-comment formatting as (char length, attributes), equal runs merged.
    formatting: Vec<(usize, BTreeMap<String, LoroValue>)>,
    records: LoroValue,
    order: LoroValue,
    /// Anchored text per comment key, separate ranges joined by U+0000.
    anchors: BTreeMap<String, String>,
}

impl VisibleState {
    fn text_differs(&self, other: &Self) -> bool {
        self.text != other.text || self.formatting != other.formatting
    }

    fn comments_differ(&self, other: &Self) -> bool {
        self.records != other.records || self.order != other.order || self.anchors != other.anchors
    }
}

impl ReplicatedDoc {
    /// Create an empty document with a random replica id.
    pub fn new() -> Self {
        Self::with_peer(random_peer_id()).unwrap_or_else(|_| Self::from_doc(LoroDoc::new()))
    }

    /// Create an empty document for the given replica id.
    pub fn with_peer(peer: u64) -> Result<Self, CrdtError> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer)?;
        Ok(Self::from_doc(doc))
    }

    /// Hydrate from a full snapshot.
    pub fn from_snapshot(snapshot: &[u8], peer: u64) -> Result<Self, CrdtError> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer)?;
        doc.import(snapshot)
            .map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        Ok(Self::from_doc(doc))
    }

    fn from_doc(doc: LoroDoc) -> Self {
        configure_styles(&doc);
        let content = doc.get_text(TEXT_CONTAINER);
        let comments = doc.get_map(COMMENTS_CONTAINER);
        let order = doc.get_list(COMMENT_ORDER_CONTAINER);
        let undo_mgr = new_undo_manager(&doc);
        Self {
            doc,
            content,
            comments,
            order,
            undo_mgr,
            observers: Observers::new(),
            read_only: Cell::new(false),
        }
    }

    /// Get the underlying Loro document.
    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    pub fn text(&self) -> String {
        self.content.to_string()
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.content.len_unicode()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice(&self, range: Range<usize>) -> Option<String> {
        if range.start > range.end || range.end > self.len() {
            return None;
        }
        if range.is_empty() {
            return Some(String::new());
        }
        self.content.slice(range.start, range.end).ok()
    }

    /// Reject local changes to the text (edits, marks, undo) while set.
    /// Remote updates still apply.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.set(read_only);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    /// Observe accepted mutations. Dropping the handle unsubscribes.
    pub fn subscribe(&self, callback: impl Fn(&DocChange) + 'static) -> Subscription {
        self.observers.subscribe(callback)
    }

    /// Validate and apply a batch of local ops as one commit.
    ///
    /// Returns the encoded update to broadcast. A batch with any invalid op
    /// fails without applying anything.
    pub fn apply_local(&self, ops: Vec<DocOp>) -> Result<Vec<u8>, CrdtError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        if self.read_only.get() && ops.iter().any(DocOp::touches_text) {
            return Err(CrdtError::ReadOnly);
        }
        self.validate(&ops)?;

        let before = self.doc.oplog_vv();
        for op in &ops {
            self.apply_op(op)?;
        }
        self.doc.commit();

        let text = ops.iter().any(DocOp::touches_text);
        let comments = ops.iter().any(DocOp::touches_comments);
        self.finish_local(&before, text, comments)
    }

    fn finish_local(
        &self,
        before: &VersionVector,
        text: bool,
        comments: bool,
    ) -> Result<Vec<u8>, CrdtError> {
        if self.doc.oplog_vv() == *before {
            return Ok(Vec::new());
        }
        let update = self.updates_since_version(before)?;
        trace!(bytes = update.len(), "local commit");
        let change = DocChange {
            origin: ChangeOrigin::Local,
            update,
            text,
            comments,
        };
        self.observers.emit(&change);
        Ok(change.update)
    }

    /// Merge a remote update.
    ///
    /// Returns whether anything changed. Duplicates change nothing and notify
    /// nobody. Undecodable input fails with [`CrdtError::MalformedUpdate`].
    pub fn apply_remote(&self, bytes: &[u8]) -> Result<bool, CrdtError> {
        let before = self.doc.oplog_vv();
        let seen = self.visible_state();
        let status = self
            .doc
            .import(bytes)
            .map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        if status.pending.is_some() {
            debug!("remote update waiting on missing dependencies");
        }
        if self.doc.oplog_vv() == before {
            trace!("remote update already applied");
            return Ok(false);
        }
        let now = self.visible_state();
        self.observers.emit(&DocChange {
            origin: ChangeOrigin::Remote,
            update: Vec::new(),
            text: now.text_differs(&seen),
            comments: now.comments_differ(&seen),
        });
        Ok(true)
    }

    /// Export full snapshot.
    pub fn snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        Ok(self.doc.export(ExportMode::Snapshot)?)
    }

    /// Get current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Current version vector in wire encoding.
    pub fn encoded_version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Updates a replica at the encoded `version` is missing. An empty
    /// version means the replica has nothing and gets the full history.
    pub fn updates_since(&self, version: &[u8]) -> Result<Vec<u8>, CrdtError> {
        if version.is_empty() {
            return self.updates_since_version(&VersionVector::default());
        }
        let version = VersionVector::decode(version)
            .map_err(|e| CrdtError::MalformedUpdate(e.to_string()))?;
        self.updates_since_version(&version)
    }

    pub fn updates_since_version(&self, version: &VersionVector) -> Result<Vec<u8>, CrdtError> {
        Ok(self.doc.export(ExportMode::Updates {
            from: Cow::Borrowed(version),
        })?)
    }

    pub fn can_undo(&self) -> bool {
        self.undo_mgr.borrow().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo_mgr.borrow().can_redo()
    }

    /// Undo the latest local edit. Remote edits are never undone.
    ///
    /// Returns the update to broadcast, or `None` when there was nothing to undo.
    pub fn undo(&self) -> Result<Option<Vec<u8>>, CrdtError> {
        self.ensure_writable()?;
        let before = self.doc.oplog_vv();
        let undone = self.undo_mgr.borrow_mut().undo()?;
        if !undone {
            return Ok(None);
        }
        self.doc.commit();
        self.finish_local(&before, true, true).map(Some)
    }

    pub fn redo(&self) -> Result<Option<Vec<u8>>, CrdtError> {
        self.ensure_writable()?;
        let before = self.doc.oplog_vv();
        let redone = self.undo_mgr.borrow_mut().redo()?;
        if !redone {
            return Ok(None);
        }
        self.doc.commit();
        self.finish_local(&before, true, true).map(Some)
    }

    pub fn clear_history(&self) {
        // No clear on Loro's UndoManager; start a fresh one.
        *self.undo_mgr.borrow_mut() = LoroUndoManager::new(&self.doc);
        self.undo_mgr.borrow_mut().set_merge_interval(0);
    }

    /// The content as attribute runs, in document order.
    pub fn runs(&self) -> Vec<StyledRun> {
        let mut runs = Vec::new();
        let mut pos = 0;
        for delta in self.content.to_delta() {
            if let TextDelta::Insert { insert, attributes } = delta {
                let len = insert.chars().count();
                runs.push(StyledRun {
                    start: pos,
                    text: insert,
                    attrs: attributes
                        .map(|attrs| attrs.into_iter().collect())
                        .unwrap_or_default(),
                });
                pos += len;
            }
        }
        runs
    }

    /// Ranges currently carrying a set mark `key`, adjacent runs merged.
    pub fn marked_ranges(&self, key: &str) -> Vec<Range<usize>> {
        let mut ranges: Vec<Range<usize>> = Vec::new();
        for run in self.runs() {
            if run.attr(key).is_none() {
                continue;
            }
            let range = run.range();
            match ranges.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => ranges.push(range),
            }
        }
        ranges
    }

    pub fn has_thread(&self, id: &str) -> bool {
        self.thread_map(id).is_some()
    }

    /// Deep value of the comment records map.
    pub fn comments_value(&self) -> LoroValue {
        self.comments.get_deep_value()
    }

    /// Thread ids in creation order, duplicates removed.
    pub fn comment_order(&self) -> Vec<SmolStr> {
        let mut seen = HashSet::new();
        let LoroValue::List(items) = self.order.get_value() else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| value_str(item).map(SmolStr::new))
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    fn ensure_writable(&self) -> Result<(), CrdtError> {
        if self.read_only.get() {
            return Err(CrdtError::ReadOnly);
        }
        Ok(())
    }

    fn visible_state(&self) -> VisibleState {
        let mut formatting: Vec<(usize, BTreeMap<String, LoroValue>)> = Vec::new();
        let mut anchors: BTreeMap<String, String> = BTreeMap::new();
        let mut anchor_ends: BTreeMap<String, usize> = BTreeMap::new();
        for run in self.runs() {
            let len = run.char_len();
            let mut attrs = BTreeMap::new();
            for (key, value) in run.attrs.iter().filter(|(_, v)| mark_is_set(v)) {
                if !key.starts_with(COMMENT_KEY_PREFIX) {
                    attrs.insert(key.clone(), value.clone());
                    continue;
                }
                let anchored = anchors.entry(key.clone()).or_default();
                if anchor_ends.get(key).is_some_and(|end| *end != run.start) {
                    anchored.push('\0');
                }
                anchored.push_str(&run.text);
                anchor_ends.insert(key.clone(), run.start + len);
            }
            match formatting.last_mut() {
                Some((last_len, last)) if *last == attrs => *last_len += len,
                _ => formatting.push((len, attrs)),
            }
        }
        VisibleState {
            text: self.text(),
            formatting,
            records: self.comments_value(),
            order: self.order.get_value(),
            anchors,
        }
    }

    fn thread_map(&self, id: &str) -> Option<LoroMap> {
        match self.comments.get(id)? {
            ValueOrContainer::Container(Container::Map(map)) => Some(map),
            _ => None,
        }
    }

    fn validate(&self, ops: &[DocOp]) -> Result<(), CrdtError> {
        let mut len = self.len();
        let mut created: HashSet<&str> = HashSet::new();
        let mut deleted: HashSet<&str> = HashSet::new();

        let exists = |id: &str, created: &HashSet<&str>, deleted: &HashSet<&str>| {
            !deleted.contains(id) && (created.contains(id) || self.has_thread(id))
        };

        for op in ops {
            match op {
                DocOp::Insert { pos, text } => {
                    if *pos > len {
                        return Err(CrdtError::InvalidRange {
                            range: *pos..*pos,
                            len,
                        });
                    }
                    len += text.chars().count();
                }
                DocOp::Delete { range } => {
                    if range.start > range.end || range.end > len {
                        return Err(CrdtError::InvalidRange {
                            range: range.clone(),
                            len,
                        });
                    }
                    len -= range.len();
                }
                DocOp::Mark { range, .. } | DocOp::Unmark { range, .. } => {
                    if range.start >= range.end || range.end > len {
                        return Err(CrdtError::InvalidRange {
                            range: range.clone(),
                            len,
                        });
                    }
                }
                DocOp::CreateThread { thread } => {
                    deleted.remove(thread.id.as_str());
                    created.insert(thread.id.as_str());
                }
                DocOp::AddReply { thread, .. } | DocOp::SetResolved { thread, .. } => {
                    if !exists(thread, &created, &deleted) {
                        return Err(CrdtError::ThreadNotFound(thread.clone()));
                    }
                }
                DocOp::DeleteThread { thread } => {
                    if !exists(thread, &created, &deleted) {
                        return Err(CrdtError::ThreadNotFound(thread.clone()));
                    }
                    created.remove(thread.as_str());
                    deleted.insert(thread.as_str());
                }
            }
        }
        Ok(())
    }

    fn apply_op(&self, op: &DocOp) -> Result<(), CrdtError> {
        match op {
            DocOp::Insert { pos, text } => {
                if !text.is_empty() {
                    self.content.insert(*pos, text)?;
                }
            }
            DocOp::Delete { range } => {
                if !range.is_empty() {
                    self.content.delete(range.start, range.len())?;
                }
            }
            DocOp::Mark { range, key, value } => {
                self.content.mark(range.clone(), key, value.clone())?;
            }
            DocOp::Unmark { range, key } => {
                self.content.unmark(range.clone(), key)?;
            }
            DocOp::CreateThread { thread } => self.create_thread(thread)?,
            DocOp::AddReply { thread, reply } => {
                let map = self
                    .thread_map(thread)
                    .ok_or_else(|| CrdtError::ThreadNotFound(thread.clone()))?;
                let replies = match map.get("replies") {
                    Some(ValueOrContainer::Container(Container::List(list))) => list,
                    _ => map.insert_container("replies", LoroList::new())?,
                };
                write_reply(&replies, reply)?;
            }
            DocOp::SetResolved { thread, resolved } => {
                let map = self
                    .thread_map(thread)
                    .ok_or_else(|| CrdtError::ThreadNotFound(thread.clone()))?;
                map.insert("resolved", *resolved)?;
            }
            DocOp::DeleteThread { thread } => {
                self.comments.delete(thread)?;
                if let LoroValue::List(items) = self.order.get_value() {
                    let positions: Vec<usize> = items
                        .iter()
                        .enumerate()
                        .filter(|(_, item)| value_str(item) == Some(thread.as_str()))
                        .map(|(pos, _)| pos)
                        .collect();
                    for pos in positions.into_iter().rev() {
                        self.order.delete(pos, 1)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn create_thread(&self, thread: &CommentThread) -> Result<(), CrdtError> {
        let map = self
            .comments
            .insert_container(&thread.id, LoroMap::new())?;
        map.insert("id", thread.id.as_str())?;
        map.insert("text", thread.text.as_str())?;
        map.insert("author", thread.author.as_str())?;
        map.insert("authorColor", thread.author_color.as_str())?;
        map.insert("createdAt", thread.created_at)?;
        map.insert("resolved", thread.resolved)?;
        let replies = map.insert_container("replies", LoroList::new())?;
        for reply in &thread.replies {
            write_reply(&replies, reply)?;
        }
        self.order.push(thread.id.as_str())?;
        Ok(())
    }
}

fn write_reply(replies: &LoroList, reply: &CommentReply) -> Result<(), CrdtError> {
    let map = replies.push_container(LoroMap::new())?;
    map.insert("id", reply.id.as_str())?;
    map.insert("text", reply.text.as_str())?;
    map.insert("author", reply.author.as_str())?;
    map.insert("authorColor", reply.author_color.as_str())?;
    map.insert("createdAt", reply.created_at)?;
    Ok(())
}

impl Default for ReplicatedDoc {
    fn default() -> Self {
        Self::new()
    }
}
