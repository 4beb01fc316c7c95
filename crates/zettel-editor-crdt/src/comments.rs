//! Comment threads anchored to document ranges.
//!
//! Each thread is a shared map under the `comments` root keyed by thread id,
//! with its replies in a shared list, so concurrent edits to different fields
//! or concurrent replies all survive. Creation order lives in the
//! `comment_order` list. A thread is anchored by the mark `comment:<id>` over
//! a contiguous range; the record exists independently of its anchor.

use std::collections::HashSet;
use std::ops::Range;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use loro::LoroValue;
use serde::{Deserialize, Serialize};
use smol_str::{SmolStr, format_smolstr};
use tracing::debug;

use crate::CrdtError;
use crate::store::{DocOp, ReplicatedDoc, comment_key, value_str};

/// Who wrote a comment or reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub name: SmolStr,
    /// CSS colour used for the author's highlight.
    pub color: SmolStr,
}

impl Author {
    pub fn new(name: impl Into<SmolStr>, color: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReply {
    pub id: SmolStr,
    pub text: String,
    pub author: SmolStr,
    pub author_color: SmolStr,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThread {
    pub id: SmolStr,
    pub text: String,
    pub author: SmolStr,
    pub author_color: SmolStr,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub resolved: bool,
    pub replies: Vec<CommentReply>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn new_id(prefix: &str) -> SmolStr {
    format_smolstr!("{prefix}-{:016x}", rand::random::<u64>())
}

fn field_str(map: &LoroValue, key: &str) -> SmolStr {
    match map {
        LoroValue::Map(map) => map
            .get(key)
            .and_then(value_str)
            .map(SmolStr::new)
            .unwrap_or_default(),
        _ => SmolStr::default(),
    }
}

fn field_i64(map: &LoroValue, key: &str) -> i64 {
    match map {
        LoroValue::Map(map) => match map.get(key) {
            Some(LoroValue::I64(v)) => *v,
            Some(LoroValue::Double(v)) => *v as i64,
            _ => 0,
        },
        _ => 0,
    }
}

fn field_bool(map: &LoroValue, key: &str) -> bool {
    match map {
        LoroValue::Map(map) => matches!(map.get(key), Some(LoroValue::Bool(true))),
        _ => false,
    }
}

fn parse_reply(value: &LoroValue) -> CommentReply {
    CommentReply {
        id: field_str(value, "id"),
        text: field_str(value, "text").into(),
        author: field_str(value, "author"),
        author_color: field_str(value, "authorColor"),
        created_at: field_i64(value, "createdAt"),
    }
}

fn parse_thread(id: &str, value: &LoroValue) -> CommentThread {
    let replies = match value {
        LoroValue::Map(map) => match map.get("replies") {
            Some(LoroValue::List(items)) => items.iter().map(parse_reply).collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    CommentThread {
        id: SmolStr::new(id),
        text: field_str(value, "text").into(),
        author: field_str(value, "author"),
        author_color: field_str(value, "authorColor"),
        created_at: field_i64(value, "createdAt"),
        resolved: field_bool(value, "resolved"),
        replies,
    }
}

/// Read all threads: creation order first, then any record missing from the
/// order list, oldest first.
pub fn read_threads(store: &ReplicatedDoc) -> Vec<CommentThread> {
    let LoroValue::Map(records) = store.comments_value() else {
        return Vec::new();
    };
    let mut threads: Vec<CommentThread> = store
        .comment_order()
        .iter()
        .filter_map(|id| records.get(id.as_str()).map(|v| parse_thread(id, v)))
        .collect();

    let listed: HashSet<SmolStr> = threads.iter().map(|t| t.id.clone()).collect();
    let mut stray: Vec<CommentThread> = records
        .iter()
        .filter(|(id, _)| !listed.contains(id.as_str()))
        .map(|(id, v)| parse_thread(id, v))
        .collect();
    stray.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    threads.extend(stray);
    threads
}

/// Ids of threads that exist and are unresolved.
pub fn live_thread_ids(store: &ReplicatedDoc) -> HashSet<SmolStr> {
    let LoroValue::Map(records) = store.comments_value() else {
        return HashSet::new();
    };
    records
        .iter()
        .filter(|(_, v)| !field_bool(v, "resolved"))
        .map(|(id, _)| SmolStr::new(id))
        .collect()
}

/// Comment operations on a shared document.
///
/// On a read-only document, anything that would mark or unmark text fails
/// with [`CrdtError::ReadOnly`]; thread records stay writable.
#[derive(Clone)]
pub struct Comments {
    store: Rc<ReplicatedDoc>,
}

impl Comments {
    pub fn new(store: Rc<ReplicatedDoc>) -> Self {
        Self { store }
    }

    /// Create a thread, anchored over `selection` when it is non-empty.
    ///
    /// Returns the new thread id and the update to broadcast.
    pub fn add_comment(
        &self,
        text: &str,
        author: &Author,
        selection: Option<Range<usize>>,
    ) -> Result<(SmolStr, Vec<u8>), CrdtError> {
        let id = new_id("c");
        let mut ops = vec![DocOp::CreateThread {
            thread: CommentThread {
                id: id.clone(),
                text: text.to_string(),
                author: author.name.clone(),
                author_color: author.color.clone(),
                created_at: now_millis(),
                resolved: false,
                replies: Vec::new(),
            },
        }];
        if let Some(range) = selection.filter(|r| !r.is_empty()) {
            ops.push(DocOp::Mark {
                range,
                key: comment_key(&id),
                value: true.into(),
            });
        }
        let update = self.store.apply_local(ops)?;
        debug!(thread = %id, "comment added");
        Ok((id, update))
    }

    /// Move a thread's anchor to `range`, stripping any previous anchor.
    pub fn anchor(&self, thread: &str, range: Range<usize>) -> Result<Vec<u8>, CrdtError> {
        if !self.store.has_thread(thread) {
            return Err(CrdtError::ThreadNotFound(thread.into()));
        }
        let mut ops = self.strip_ops(thread);
        ops.push(DocOp::Mark {
            range,
            key: comment_key(thread),
            value: true.into(),
        });
        self.store.apply_local(ops)
    }

    /// Append a reply. Returns the reply id and the update to broadcast.
    pub fn add_reply(
        &self,
        thread: &str,
        text: &str,
        author: &Author,
    ) -> Result<(SmolStr, Vec<u8>), CrdtError> {
        let id = new_id("r");
        let update = self.store.apply_local(vec![DocOp::AddReply {
            thread: thread.into(),
            reply: CommentReply {
                id: id.clone(),
                text: text.to_string(),
                author: author.name.clone(),
                author_color: author.color.clone(),
                created_at: now_millis(),
            },
        }])?;
        Ok((id, update))
    }

    /// Flip the resolved flag. Returns the new state and the update.
    pub fn toggle_resolve(&self, thread: &str) -> Result<(bool, Vec<u8>), CrdtError> {
        let current = self
            .thread(thread)
            .ok_or_else(|| CrdtError::ThreadNotFound(thread.into()))?;
        let resolved = !current.resolved;
        let update = self.set_resolved(thread, resolved)?;
        Ok((resolved, update))
    }

    /// Set the resolved flag. Resolving strips every range still carrying the
    /// thread's mark; unresolving leaves the document alone. Setting the
    /// current state again changes nothing.
    pub fn set_resolved(&self, thread: &str, resolved: bool) -> Result<Vec<u8>, CrdtError> {
        let current = self
            .thread(thread)
            .ok_or_else(|| CrdtError::ThreadNotFound(thread.into()))?;

        let mut ops = Vec::new();
        if current.resolved != resolved {
            ops.push(DocOp::SetResolved {
                thread: thread.into(),
                resolved,
            });
        }
        if resolved {
            ops.extend(self.strip_ops(thread));
        }
        self.store.apply_local(ops)
    }

    /// Remove a thread, its order entry and any residual anchor.
    pub fn delete_comment(&self, thread: &str) -> Result<Vec<u8>, CrdtError> {
        let mut ops = vec![DocOp::DeleteThread {
            thread: thread.into(),
        }];
        ops.extend(self.strip_ops(thread));
        self.store.apply_local(ops)
    }

    pub fn threads(&self) -> Vec<CommentThread> {
        read_threads(&self.store)
    }

    pub fn thread(&self, id: &str) -> Option<CommentThread> {
        let LoroValue::Map(records) = self.store.comments_value() else {
            return None;
        };
        records.get(id).map(|v| parse_thread(id, v))
    }

    /// Ranges currently carrying the thread's mark.
    pub fn anchor_ranges(&self, thread: &str) -> Vec<Range<usize>> {
        self.store.marked_ranges(&comment_key(thread))
    }

    fn strip_ops(&self, thread: &str) -> Vec<DocOp> {
        let key = comment_key(thread);
        self.store
            .marked_ranges(&key)
            .into_iter()
            .map(|range| DocOp::Unmark {
                range,
                key: key.clone(),
            })
            .collect()
    }
}
