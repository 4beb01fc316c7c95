//! Block-level render caching.
//!
//! Every re-render rebuilds the whole [`RichDocument`], but a host UI only
//! needs to touch blocks whose content changed. The cache keeps the rendered
//! HTML of each block keyed by a content hash and reports which block indices
//! differ from the previous render.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use smol_str::{SmolStr, format_smolstr};

use crate::model::{Block, RichDocument};
use crate::render::{LinkTargetValidator, render_block};

/// Hash block content for change detection.
///
/// Position is excluded: a block shifted by an edit above it is unchanged.
pub fn hash_block(block: &Block) -> u64 {
    let mut hasher = DefaultHasher::new();
    block.kind.hash(&mut hasher);
    block.inlines.hash(&mut hasher);
    hasher.finish()
}

/// Generate a block ID from monotonic counter.
pub fn make_block_id(index: usize) -> SmolStr {
    format_smolstr!("b-{}", index)
}

/// A cached block render that can be reused if its content hasn't changed.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedBlock {
    /// Stable ID for host-side element identity.
    pub id: SmolStr,
    pub source_hash: u64,
    /// Char range in the source sequence at the time of the last update.
    pub char_range: Range<usize>,
    pub html: String,
}

/// Result of a cache update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderDiff {
    /// Indices (in the new block list) whose content differs from the block
    /// previously at the same index.
    pub changed: Vec<usize>,
    /// Number of trailing blocks that no longer exist.
    pub removed: usize,
}

impl RenderDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed == 0
    }
}

/// Cache for incremental block rendering.
#[derive(Clone, Debug, Default)]
pub struct RenderCache {
    pub blocks: Vec<CachedBlock>,
    /// Next available block ID.
    pub next_block_id: usize,
}

impl RenderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the cache in line with `doc`, re-rendering only new content.
    pub fn update<V: LinkTargetValidator>(&mut self, doc: &RichDocument, validator: &V) -> RenderDiff {
        let mut reusable: HashMap<u64, Vec<CachedBlock>> = HashMap::new();
        let previous_hashes: Vec<u64> = self.blocks.iter().map(|b| b.source_hash).collect();
        for cached in self.blocks.drain(..).rev() {
            reusable.entry(cached.source_hash).or_default().push(cached);
        }

        let mut diff = RenderDiff::default();
        let mut rendered = 0usize;
        for (index, block) in doc.blocks.iter().enumerate() {
            let hash = hash_block(block);
            if previous_hashes.get(index) != Some(&hash) {
                diff.changed.push(index);
            }
            let cached = match reusable.get_mut(&hash).and_then(Vec::pop) {
                Some(mut cached) => {
                    cached.char_range = block.char_range.clone();
                    cached
                }
                None => {
                    rendered += 1;
                    let id = make_block_id(self.next_block_id);
                    self.next_block_id += 1;
                    CachedBlock {
                        id,
                        source_hash: hash,
                        char_range: block.char_range.clone(),
                        html: render_block(block, validator),
                    }
                }
            };
            self.blocks.push(cached);
        }
        diff.removed = previous_hashes.len().saturating_sub(doc.blocks.len());

        tracing::trace!(
            blocks = doc.blocks.len(),
            rendered,
            changed = diff.changed.len(),
            "render cache updated"
        );
        diff
    }

    /// Full HTML of the cached blocks, one element per block.
    pub fn html(&self) -> String {
        self.blocks.iter().map(|b| b.html.as_str()).collect()
    }

    /// Find the cached block containing a char offset.
    pub fn block_at(&self, offset: usize) -> Option<(usize, &CachedBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.char_range.contains(&offset) || b.char_range.end == offset)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockKind, Inline, InlineStyle};

    fn doc(lines: &[(BlockKind, &str)]) -> RichDocument {
        let mut start = 0;
        let blocks = lines
            .iter()
            .map(|(kind, text)| {
                let mut block = Block::new(*kind, start);
                if !text.is_empty() {
                    block.push(Inline::Text {
                        text: text.to_string(),
                        style: InlineStyle::default(),
                    });
                }
                start = block.char_range.end + 1;
                block
            })
            .collect();
        RichDocument { blocks }
    }

    #[test]
    fn first_update_marks_everything_changed() {
        let mut cache = RenderCache::new();
        let diff = cache.update(&doc(&[(BlockKind::Paragraph, "a"), (BlockKind::Paragraph, "b")]), &());
        assert_eq!(diff.changed, vec![0, 1]);
        assert_eq!(cache.html(), "<p>a</p><p>b</p>");
        assert_eq!(cache.blocks[0].id, "b-0");
        assert_eq!(cache.blocks[1].id, "b-1");
    }

    #[test]
    fn editing_one_block_reports_only_that_index() {
        let mut cache = RenderCache::new();
        cache.update(&doc(&[(BlockKind::Paragraph, "a"), (BlockKind::Paragraph, "b")]), &());

        let diff = cache.update(
            &doc(&[(BlockKind::Paragraph, "a"), (BlockKind::Heading(1), "b")]),
            &(),
        );
        assert_eq!(diff.changed, vec![1]);
        assert_eq!(diff.removed, 0);
        assert_eq!(cache.blocks[0].id, "b-0");
        assert_eq!(cache.blocks[1].id, "b-2");
        assert_eq!(cache.blocks[1].html, "<h1>b</h1>");
    }

    #[test]
    fn shifted_blocks_keep_identity() {
        let mut cache = RenderCache::new();
        cache.update(&doc(&[(BlockKind::Paragraph, "a"), (BlockKind::Paragraph, "b")]), &());

        let diff = cache.update(
            &doc(&[
                (BlockKind::Paragraph, "new"),
                (BlockKind::Paragraph, "a"),
                (BlockKind::Paragraph, "b"),
            ]),
            &(),
        );
        assert_eq!(diff.changed, vec![0, 1, 2]);
        assert_eq!(cache.blocks[1].id, "b-0");
        assert_eq!(cache.blocks[2].id, "b-1");
        assert_eq!(cache.blocks[2].char_range, 6..7);
    }

    #[test]
    fn removed_blocks_are_counted() {
        let mut cache = RenderCache::new();
        cache.update(
            &doc(&[
                (BlockKind::Paragraph, "a"),
                (BlockKind::Paragraph, "b"),
                (BlockKind::Paragraph, "c"),
            ]),
            &(),
        );
        let diff = cache.update(&doc(&[(BlockKind::Paragraph, "a")]), &());
        assert!(diff.changed.is_empty());
        assert_eq!(diff.removed, 2);
        assert!(!diff.is_empty());
        assert_eq!(cache.block_at(1).map(|(i, _)| i), Some(0));
    }
}
