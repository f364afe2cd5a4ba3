//! Markdown to Telegram-HTML conversion.
//!
//! Staged rewrite: code blocks and inline code are pulled out behind opaque
//! placeholder tokens first, the remaining text is HTML-escaped exactly
//! once, the markdown constructs become tags, and finally the code segments
//! are substituted back. Plain text with no markdown characters is just
//! escaped.

use std::sync::LazyLock;

use regex::Regex;

static RE_CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[\w-]*\n?([\s\S]*?)```").expect("code block pattern"));
static RE_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("inline code pattern"));
static RE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+)$").expect("heading pattern"));
static RE_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^>\s*(.*)$").expect("quote pattern"));
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("link pattern"));
static RE_BOLD_A: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("bold pattern"));
static RE_BOLD_B: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__(.+?)__").expect("bold underscore pattern"));
static RE_ITALIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|[^a-zA-Z0-9])_([^_\n]+)_([^a-zA-Z0-9]|$)").expect("italic pattern")
});
static RE_STRIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"~~(.+?)~~").expect("strike pattern"));
static RE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[-*]\s+").expect("bullet pattern"));

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

pub fn markdown_to_telegram_html(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    if !text.contains(['`', '*', '_', '~', '[', ']', '(', ')', '#', '>', '-']) {
        return escape_html(text);
    }

    let mut replacements: Vec<(String, String)> = Vec::new();

    let text = RE_CODE_BLOCK.replace_all(text, |caps: &regex::Captures| {
        let token = format!("\u{0}CB{}\u{0}", replacements.len());
        let html = format!("<pre><code>{}</code></pre>", escape_html(&caps[1]));
        replacements.push((token.clone(), html));
        token
    });

    let text = RE_INLINE_CODE.replace_all(&text, |caps: &regex::Captures| {
        let token = format!("\u{0}IC{}\u{0}", replacements.len());
        let html = format!("<code>{}</code>", escape_html(&caps[1]));
        replacements.push((token.clone(), html));
        token
    });

    let text = RE_HEADING.replace_all(&text, "$1");
    let text = RE_QUOTE.replace_all(&text, "$1");
    let text = escape_html(&text);
    let text = RE_LINK.replace_all(&text, r#"<a href="$2">$1</a>"#);
    let text = RE_BOLD_A.replace_all(&text, "<b>$1</b>");
    let text = RE_BOLD_B.replace_all(&text, "<b>$1</b>");
    let text = RE_ITALIC.replace_all(&text, "$1<i>$2</i>$3");
    let text = RE_STRIKE.replace_all(&text, "<s>$1</s>");
    let mut text = RE_BULLET.replace_all(&text, "\u{2022} ").into_owned();

    for (token, html) in replacements {
        text = text.replace(&token, &html);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_just_escaped() {
        assert_eq!(markdown_to_telegram_html("hello world"), "hello world");
        assert_eq!(
            markdown_to_telegram_html("a < b & c"),
            "a &lt; b &amp; c"
        );
        assert_eq!(markdown_to_telegram_html(""), "");
    }

    #[test]
    fn code_blocks_escape_exactly_once() {
        let out = markdown_to_telegram_html("```rust\nlet x = a < b;\n```");
        assert_eq!(out, "<pre><code>let x = a &lt; b;\n</code></pre>");
    }

    #[test]
    fn inline_code_is_preserved_verbatim() {
        let out = markdown_to_telegram_html("run `ls -la **now**`");
        assert_eq!(out, "run <code>ls -la **now**</code>");
    }

    #[test]
    fn basic_constructs() {
        assert_eq!(markdown_to_telegram_html("**bold**"), "<b>bold</b>");
        assert_eq!(markdown_to_telegram_html("__bold__"), "<b>bold</b>");
        assert_eq!(markdown_to_telegram_html("x _it_ y"), "x <i>it</i> y");
        assert_eq!(markdown_to_telegram_html("~~gone~~"), "<s>gone</s>");
        assert_eq!(
            markdown_to_telegram_html("[site](https://x.dev)"),
            r#"<a href="https://x.dev">site</a>"#
        );
        assert_eq!(markdown_to_telegram_html("# Title"), "Title");
        assert_eq!(markdown_to_telegram_html("> quoted"), "quoted");
        assert_eq!(markdown_to_telegram_html("- item"), "\u{2022} item");
    }

    #[test]
    fn snake_case_identifiers_stay_intact() {
        // The italic rule must not fire inside identifiers.
        assert_eq!(
            markdown_to_telegram_html("- call read_file now"),
            "\u{2022} call read_file now"
        );
    }
}
