//! Structured rich-text tree rendered by the editor.
//!
//! The CRDT binding rebuilds a [`RichDocument`] from the replicated character
//! sequence; renderers and exporters only ever see this tree.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Placeholder character occupying the single position of an atomic inline node.
pub const OBJECT_REPLACEMENT: char = '\u{FFFC}';

/// Block-level formatting of a line.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlockKind {
    #[default]
    Paragraph,
    /// Heading level 1-6.
    Heading(u8),
    BulletItem,
    OrderedItem,
    Blockquote,
    CodeBlock,
}

impl BlockKind {
    /// Attribute value stored on the line terminator. Paragraphs carry none.
    pub fn as_attr(&self) -> Option<SmolStr> {
        match self {
            BlockKind::Paragraph => None,
            BlockKind::Heading(level) => Some(smol_str::format_smolstr!("h{}", level)),
            BlockKind::BulletItem => Some(SmolStr::new_static("bullet")),
            BlockKind::OrderedItem => Some(SmolStr::new_static("ordered")),
            BlockKind::Blockquote => Some(SmolStr::new_static("blockquote")),
            BlockKind::CodeBlock => Some(SmolStr::new_static("code")),
        }
    }

    /// Parse a stored attribute value. Unknown values fall back to `None`.
    pub fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "bullet" => Some(BlockKind::BulletItem),
            "ordered" => Some(BlockKind::OrderedItem),
            "blockquote" => Some(BlockKind::Blockquote),
            "code" => Some(BlockKind::CodeBlock),
            _ => {
                let level = attr.strip_prefix('h')?.parse::<u8>().ok()?;
                (1..=6).contains(&level).then_some(BlockKind::Heading(level))
            }
        }
    }

    /// False for a heading level outside 1-6.
    pub fn is_valid(&self) -> bool {
        match self {
            BlockKind::Heading(level) => (1..=6).contains(level),
            _ => true,
        }
    }

    /// Heading level, if this is a heading.
    pub fn heading_level(&self) -> Option<u8> {
        match self {
            BlockKind::Heading(level) => Some(*level),
            _ => None,
        }
    }

    pub fn is_list_item(&self) -> bool {
        matches!(self, BlockKind::BulletItem | BlockKind::OrderedItem)
    }
}

/// Inline formatting toggled by the user.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mark {
    Bold,
    Italic,
    Code,
    Link { href: SmolStr },
}

/// Resolved set of inline attributes on a run of text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct InlineStyle {
    pub bold: bool,
    pub italic: bool,
    pub code: bool,
    pub link: Option<SmolStr>,
    /// Live comment threads anchored over this run, sorted by id.
    pub comments: Vec<SmolStr>,
}

impl InlineStyle {
    pub fn is_plain(&self) -> bool {
        *self == InlineStyle::default()
    }

    /// Check whether the style carries the given mark.
    pub fn has(&self, mark: &Mark) -> bool {
        match mark {
            Mark::Bold => self.bold,
            Mark::Italic => self.italic,
            Mark::Code => self.code,
            Mark::Link { href } => self.link.as_ref() == Some(href),
        }
    }
}

/// Attributes of an embedded reference to another document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocLinkAttrs {
    /// Target document id.
    pub id: SmolStr,
    /// Cached title of the target document.
    pub label: SmolStr,
    /// Display override chosen by the author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<SmolStr>,
}

impl DocLinkAttrs {
    pub fn new(id: impl Into<SmolStr>, label: impl Into<SmolStr>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            custom_text: None,
        }
    }

    pub fn with_custom_text(mut self, text: impl Into<SmolStr>) -> Self {
        self.custom_text = Some(text.into());
        self
    }

    /// Text shown for the reference.
    pub fn display_text(&self) -> &str {
        self.custom_text.as_deref().unwrap_or(&self.label)
    }
}

/// Inline content of a block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Inline {
    Text { text: String, style: InlineStyle },
    /// Atomic reference node; occupies exactly one char position.
    DocLink { attrs: DocLinkAttrs, style: InlineStyle },
}

impl Inline {
    /// Length in chars this inline occupies in the source sequence.
    pub fn char_len(&self) -> usize {
        match self {
            Inline::Text { text, .. } => text.chars().count(),
            Inline::DocLink { .. } => 1,
        }
    }

    pub fn style(&self) -> &InlineStyle {
        match self {
            Inline::Text { style, .. } | Inline::DocLink { style, .. } => style,
        }
    }
}

/// One line of the document with its block formatting.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    pub kind: BlockKind,
    pub inlines: Vec<Inline>,
    /// Char range of the line content in the source sequence (terminator excluded).
    pub char_range: Range<usize>,
}

impl Block {
    pub fn new(kind: BlockKind, start: usize) -> Self {
        Self {
            kind,
            inlines: Vec::new(),
            char_range: start..start,
        }
    }

    /// Append an inline, merging with the previous text run when styles match.
    pub fn push(&mut self, inline: Inline) {
        self.char_range.end += inline.char_len();
        if let (
            Some(Inline::Text { text, style }),
            Inline::Text {
                text: next,
                style: next_style,
            },
        ) = (self.inlines.last_mut(), &inline)
        {
            if style == next_style {
                text.push_str(next);
                return;
            }
        }
        self.inlines.push(inline);
    }

    /// Plain text of the block, using display text for references.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for inline in &self.inlines {
            match inline {
                Inline::Text { text, .. } => out.push_str(text),
                Inline::DocLink { attrs, .. } => out.push_str(attrs.display_text()),
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.inlines.is_empty()
    }
}

/// The whole rendered document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RichDocument {
    pub blocks: Vec<Block>,
}

impl RichDocument {
    /// All document references in document order.
    pub fn doc_links(&self) -> impl Iterator<Item = &DocLinkAttrs> {
        self.blocks.iter().flat_map(|block| {
            block.inlines.iter().filter_map(|inline| match inline {
                Inline::DocLink { attrs, .. } => Some(attrs),
                Inline::Text { .. } => None,
            })
        })
    }

    /// Plain text of the whole document, one line per block.
    pub fn plain_text(&self) -> String {
        self.blocks
            .iter()
            .map(Block::plain_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
