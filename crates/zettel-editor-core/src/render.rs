//! HTML rendering of the rich-text tree.
//!
//! The output is the HTML fragment the Markdown exporter consumes, and the
//! markup a host UI can inject directly. Block grouping rules:
//! - consecutive bullet / ordered items share one `<ul>` / `<ol>`
//! - consecutive code lines merge into one `<pre><code>`
//! - consecutive blockquote lines merge into one `<blockquote>`

use pulldown_cmark_escape::{escape_html, escape_html_body_text};

use crate::model::{Block, BlockKind, DocLinkAttrs, Inline, InlineStyle, RichDocument};

/// Validates document-link targets during rendering.
///
/// Used to mark references whose target no longer exists.
pub trait LinkTargetValidator {
    /// Check if a document id is a live link target.
    fn is_valid_target(&self, id: &str) -> bool;
}

/// Unit type implementation - all targets are valid.
impl LinkTargetValidator for () {
    fn is_valid_target(&self, _id: &str) -> bool {
        true
    }
}

impl<T: LinkTargetValidator> LinkTargetValidator for &T {
    fn is_valid_target(&self, id: &str) -> bool {
        (*self).is_valid_target(id)
    }
}

impl<T: LinkTargetValidator> LinkTargetValidator for Option<T> {
    fn is_valid_target(&self, id: &str) -> bool {
        self.as_ref().map(|v| v.is_valid_target(id)).unwrap_or(true)
    }
}

/// Render a whole document, treating every link target as valid.
pub fn render_html(doc: &RichDocument) -> String {
    render_html_with(doc, &())
}

/// Render a whole document, consulting `validator` for link targets.
pub fn render_html_with<V: LinkTargetValidator>(doc: &RichDocument, validator: &V) -> String {
    HtmlWriter::new(validator).write_document(doc)
}

/// Render a single block on its own (used by the block render cache).
pub fn render_block<V: LinkTargetValidator>(block: &Block, validator: &V) -> String {
    let mut writer = HtmlWriter::new(validator);
    writer.write_group(std::slice::from_ref(block));
    writer.out
}

struct HtmlWriter<'v, V> {
    out: String,
    validator: &'v V,
}

impl<'v, V: LinkTargetValidator> HtmlWriter<'v, V> {
    fn new(validator: &'v V) -> Self {
        Self {
            out: String::new(),
            validator,
        }
    }

    fn write_document(mut self, doc: &RichDocument) -> String {
        let mut rest = doc.blocks.as_slice();
        while let Some(first) = rest.first() {
            let run = match first.kind {
                BlockKind::BulletItem
                | BlockKind::OrderedItem
                | BlockKind::Blockquote
                | BlockKind::CodeBlock => rest.iter().take_while(|b| b.kind == first.kind).count(),
                _ => 1,
            };
            let (group, tail) = rest.split_at(run);
            self.write_group(group);
            rest = tail;
        }
        self.out
    }

    /// Write a run of blocks sharing one kind.
    fn write_group(&mut self, group: &[Block]) {
        let Some(first) = group.first() else {
            return;
        };
        match first.kind {
            BlockKind::Paragraph => {
                for block in group {
                    self.out.push_str("<p>");
                    self.write_inlines(&block.inlines);
                    self.out.push_str("</p>");
                }
            }
            BlockKind::Heading(level) => {
                let level = level.clamp(1, 6);
                for block in group {
                    self.out.push_str(&format!("<h{level}>"));
                    self.write_inlines(&block.inlines);
                    self.out.push_str(&format!("</h{level}>"));
                }
            }
            BlockKind::BulletItem | BlockKind::OrderedItem => {
                let tag = if first.kind == BlockKind::BulletItem {
                    "ul"
                } else {
                    "ol"
                };
                self.out.push_str(&format!("<{tag}>"));
                for block in group {
                    self.out.push_str("<li>");
                    self.write_inlines(&block.inlines);
                    self.out.push_str("</li>");
                }
                self.out.push_str(&format!("</{tag}>"));
            }
            BlockKind::Blockquote => {
                self.out.push_str("<blockquote><p>");
                for (i, block) in group.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str("<br>");
                    }
                    self.write_inlines(&block.inlines);
                }
                self.out.push_str("</p></blockquote>");
            }
            BlockKind::CodeBlock => {
                self.out.push_str("<pre><code>");
                for (i, block) in group.iter().enumerate() {
                    if i > 0 {
                        self.out.push('\n');
                    }
                    // Inline marks are not rendered inside code blocks.
                    self.text(&block.plain_text());
                }
                self.out.push_str("</code></pre>");
            }
        }
    }

    fn write_inlines(&mut self, inlines: &[Inline]) {
        for inline in inlines {
            match inline {
                Inline::Text { text, style } => {
                    self.open_style(style);
                    self.text(text);
                    self.close_style(style);
                }
                Inline::DocLink { attrs, style } => {
                    self.open_style(style);
                    self.doc_link(attrs);
                    self.close_style(style);
                }
            }
        }
    }

    fn open_style(&mut self, style: &InlineStyle) {
        for id in &style.comments {
            self.out.push_str("<mark data-comment-id=\"");
            self.attr(id);
            self.out.push_str("\">");
        }
        if let Some(href) = &style.link {
            self.out.push_str("<a href=\"");
            self.attr(href);
            self.out.push_str("\">");
        }
        if style.bold {
            self.out.push_str("<strong>");
        }
        if style.italic {
            self.out.push_str("<em>");
        }
        if style.code {
            self.out.push_str("<code>");
        }
    }

    fn close_style(&mut self, style: &InlineStyle) {
        if style.code {
            self.out.push_str("</code>");
        }
        if style.italic {
            self.out.push_str("</em>");
        }
        if style.bold {
            self.out.push_str("</strong>");
        }
        if style.link.is_some() {
            self.out.push_str("</a>");
        }
        for _ in &style.comments {
            self.out.push_str("</mark>");
        }
    }

    fn doc_link(&mut self, attrs: &DocLinkAttrs) {
        self.out.push_str("<span data-type=\"doclink\" data-id=\"");
        self.attr(&attrs.id);
        self.out.push_str("\" class=\"");
        if self.validator.is_valid_target(&attrs.id) {
            self.out.push_str("doclink");
        } else {
            self.out.push_str("doclink doclink-broken");
        }
        self.out.push_str("\">");
        self.text(attrs.display_text());
        self.out.push_str("</span>");
    }

    fn text(&mut self, text: &str) {
        let _ = escape_html_body_text(&mut self.out, text);
    }

    fn attr(&mut self, value: &str) {
        let _ = escape_html(&mut self.out, value);
    }
}
