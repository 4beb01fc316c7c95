//! Deterministic HTML to Markdown export.
//!
//! The converter is a fixed sequence of pattern rewrites. It only understands
//! the subset of HTML produced by [`render_html`], plus the common aliases
//! (`<b>`, `<i>`) a pasted fragment may carry. Other HTML elements are
//! stripped; angle brackets that do not open an HTML element (`Vec<T>`,
//! `a < b`) are text and survive.
//!
//! Running [`to_markdown`] on its own output is a no-op, except for text that
//! itself spells out HTML elements or entities once decoded.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::model::RichDocument;
use crate::render::render_html;

macro_rules! pattern {
    ($name:ident, $re:literal) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).unwrap_or_else(|e| panic!("bad pattern {}: {e}", $re)));
    };
}

pattern!(PRE_BLOCK, r"(?is)<pre(?:\s[^>]*)?>\s*<code(?:\s[^>]*)?>(.*?)</code>\s*</pre>");
pattern!(HEADING, r"(?is)<h([1-6])(?:\s[^>]*)?>(.*?)</h[1-6]>");
pattern!(BOLD, r"(?is)<(?:strong|b)(?:\s[^>]*)?>(.*?)</(?:strong|b)>");
pattern!(ITALIC, r"(?is)<(?:em|i)(?:\s[^>]*)?>(.*?)</(?:em|i)>");
pattern!(INLINE_CODE, r"(?is)<code(?:\s[^>]*)?>(.*?)</code>");
pattern!(LINK, r#"(?is)<a\s[^>]*?href="([^"]*)"[^>]*>(.*?)</a>"#);
pattern!(LIST_ITEM, r"(?is)<li(?:\s[^>]*)?>(.*?)</li>");
pattern!(LIST, r"(?i)</?(?:ul|ol)(?:\s[^>]*)?>");
pattern!(BLOCKQUOTE, r"(?is)<blockquote(?:\s[^>]*)?>(.*?)</blockquote>");
pattern!(PARAGRAPH_OPEN, r"(?i)<p(?:\s[^>]*)?>");
pattern!(PARAGRAPH_CLOSE, r"(?i)</p>");
pattern!(BREAK, r"(?i)<br\s*/?>");
pattern!(PARAGRAPH, r"(?is)<p(?:\s[^>]*)?>(.*?)</p>");
pattern!(
    HTML_TAG,
    r"(?i)</?(?:a|abbr|article|b|blockquote|br|caption|cite|code|del|details|div|em|figure|h[1-6]|hr|i|img|ins|kbd|li|mark|ol|p|pre|q|s|section|small|span|strong|sub|summary|sup|table|tbody|td|th|thead|tr|u|ul)(?:\s[^<>]*)?/?>"
);
pattern!(HTML_COMMENT, r"(?s)<!--.*?-->");
pattern!(EXCESS_NEWLINES, r"\n{3,}");

/// Entities decoded after tag stripping. `&amp;` goes last so that escaped
/// entity text (`&amp;lt;`) decodes exactly once.
const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&#x27;", "'"),
    ("&amp;", "&"),
];

/// Convert an HTML fragment to Markdown.
pub fn to_markdown(html: &str) -> String {
    let md = PRE_BLOCK.replace_all(html, "\n```\n${1}\n```\n\n");
    let md = HEADING.replace_all(&md, |caps: &Captures| {
        let level = caps[1].parse::<usize>().unwrap_or(1);
        format!("{} {}\n\n", "#".repeat(level), &caps[2])
    });
    let md = BOLD.replace_all(&md, "**${1}**");
    let md = ITALIC.replace_all(&md, "*${1}*");
    let md = INLINE_CODE.replace_all(&md, "`${1}`");
    let md = LINK.replace_all(&md, "[${2}](${1})");
    let md = LIST_ITEM.replace_all(&md, "- ${1}\n");
    let md = LIST.replace_all(&md, "\n");
    let md = BLOCKQUOTE.replace_all(&md, |caps: &Captures| {
        let inner = PARAGRAPH_CLOSE.replace_all(&caps[1], "\n");
        let inner = PARAGRAPH_OPEN.replace_all(&inner, "");
        let inner = BREAK.replace_all(&inner, "\n");
        let quoted = inner
            .trim()
            .lines()
            .map(|line| {
                if line.is_empty() {
                    ">".to_string()
                } else {
                    format!("> {line}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n{quoted}\n\n")
    });
    let md = BREAK.replace_all(&md, "\n");
    let md = PARAGRAPH.replace_all(&md, "${1}\n\n");
    let md = HTML_COMMENT.replace_all(&md, "");
    let md = HTML_TAG.replace_all(&md, "");

    let mut md = md.into_owned();
    for (entity, decoded) in ENTITIES {
        if md.contains(entity) {
            md = md.replace(entity, decoded);
        }
    }

    let md = EXCESS_NEWLINES.replace_all(&md, "\n\n");
    md.trim().to_string()
}

/// Render a document to HTML and export it as Markdown.
pub fn document_to_markdown(doc: &RichDocument) -> String {
    to_markdown(&render_html(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockKind, DocLinkAttrs, Inline, InlineStyle};

    #[test]
    fn paragraphs_are_blank_line_separated() {
        assert_eq!(to_markdown("<p>one</p><p>two</p>"), "one\n\ntwo");
    }

    #[test]
    fn headings_map_to_hashes() {
        assert_eq!(to_markdown("<h1>Top</h1>"), "# Top");
        assert_eq!(to_markdown("<h3>Third</h3><p>x</p>"), "### Third\n\nx");
        assert_eq!(to_markdown("<h6 class=\"x\">Six</h6>"), "###### Six");
    }

    #[test]
    fn inline_marks() {
        assert_eq!(
            to_markdown("<p><strong>bold</strong> <b>b</b> <em>it</em> <i>i</i> <code>x</code></p>"),
            "**bold** **b** *it* *i* `x`"
        );
        assert_eq!(
            to_markdown(r#"<p><a href="https://example.com/?a=1&amp;b=2">site</a></p>"#),
            "[site](https://example.com/?a=1&b=2)"
        );
    }

    #[test]
    fn bold_pattern_ignores_br_and_blockquote() {
        assert_eq!(
            to_markdown("<blockquote><p>a<br>b</p></blockquote>"),
            "> a\n> b"
        );
    }

    #[test]
    fn lists_and_code_blocks() {
        insta::assert_snapshot!(
            to_markdown("<ul><li>one</li><li>two</li></ul><pre><code>let x = 1;\nlet y = 2;</code></pre>"),
            @r"
        - one
        - two

        ```
        let x = 1;
        let y = 2;
        ```
        "
        );
    }

    #[test]
    fn entities_decode_and_tags_strip() {
        assert_eq!(
            to_markdown("<div><span>a&nbsp;&lt;b&gt; &quot;c&quot; &amp;amp;</span></div>"),
            "a <b> \"c\" &amp;"
        );
    }

    #[test]
    fn angle_brackets_in_text_survive() {
        assert_eq!(to_markdown("<p>use Vec&lt;T&gt; here</p>"), "use Vec<T> here");
        assert_eq!(to_markdown("<p>a &lt; b &gt; c</p>"), "a < b > c");
        assert_eq!(to_markdown("<p>x<!-- note -->y<custom-tag>z</p>"), "xy<custom-tag>z");
        for text in ["use Vec<T> here", "a < b > c", "Option<String> or <T: Clone>"] {
            let once = to_markdown(text);
            assert_eq!(once, text);
            assert_eq!(to_markdown(&once), once);
        }
    }

    #[test]
    fn newlines_collapse_and_output_trims() {
        assert_eq!(to_markdown("<p>a</p><br><br><br><p>b</p>"), "a\n\nb");
        assert_eq!(to_markdown("   <p>  </p>  "), "");
    }

    #[test]
    fn export_is_idempotent() {
        let inputs = [
            "<h2>Plan</h2><p>Some <strong>bold</strong> and <em>soft</em> words.</p>",
            "<ul><li>a</li><li><code>b</code></li></ul><ol><li>c</li></ol>",
            "<blockquote><p>quoted<br>twice</p></blockquote><p>tail</p>",
            "<pre><code>fn main() {\n    println!();\n}</code></pre>",
            r#"<p>go <a href="https://example.com">there</a>&nbsp;now</p>"#,
        ];
        for html in inputs {
            let once = to_markdown(html);
            assert_eq!(to_markdown(&once), once, "not stable for {html}");
        }
    }

    #[test]
    fn document_export() {
        let mut heading = Block::new(BlockKind::Heading(1), 0);
        heading.push(Inline::Text {
            text: "Notes".into(),
            style: InlineStyle::default(),
        });
        let mut para = Block::new(BlockKind::Paragraph, 6);
        para.push(Inline::Text {
            text: "see ".into(),
            style: InlineStyle::default(),
        });
        para.push(Inline::DocLink {
            attrs: DocLinkAttrs::new("n2", "Other note"),
            style: InlineStyle::default(),
        });
        para.push(Inline::Text {
            text: " and ".into(),
            style: InlineStyle::default(),
        });
        para.push(Inline::Text {
            text: "more".into(),
            style: InlineStyle {
                italic: true,
                ..Default::default()
            },
        });
        let doc = RichDocument {
            blocks: vec![heading, para],
        };

        insta::assert_snapshot!(document_to_markdown(&doc), @r"
        # Notes

        see Other note and *more*
        ");
    }
}
