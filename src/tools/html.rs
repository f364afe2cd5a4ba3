//! Plain-text extraction from HTML for the web_fetch tool.
//!
//! Deliberately small: drop script/style/noscript subtrees, turn block-level
//! tags into newlines, strip the remaining tags, unescape entities, and
//! normalize whitespace. Good enough to hand page text to the model without
//! pulling in a DOM.

use std::sync::LazyLock;

use regex::Regex;

static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title pattern"));
static RE_DROP_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|noscript)\b[^>]*>.*?</(script|style|noscript)>")
        .expect("drop pattern")
});
static RE_BLOCK_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)</?(br|p|div|section|article|header|footer|main|nav|aside|h[1-6]|li|ul|ol|table|tr|td|th)\b[^>]*>",
    )
    .expect("block tag pattern")
});
static RE_ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern"));

/// Heuristic HTML sniff over a small prefix.
pub fn looks_like_html(body: &[u8]) -> bool {
    let prefix = &body[..body.len().min(1024)];
    let s = String::from_utf8_lossy(prefix).trim_start().to_lowercase();
    let mut end = s.len().min(512);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.starts_with("<!doctype") || s.starts_with("<html") || s[..end].contains("<html")
}

/// Extract `(title, text)` from an HTML document.
pub fn extract_html_text(src: &str) -> (String, String) {
    let title = RE_TITLE
        .captures(src)
        .and_then(|c| c.get(1))
        .map(|m| normalize_text(&unescape_entities(m.as_str())))
        .unwrap_or_default();

    let without_blocks = RE_DROP_BLOCKS.replace_all(src, "");
    let with_breaks = RE_BLOCK_TAGS.replace_all(&without_blocks, "\n");
    let stripped = RE_ANY_TAG.replace_all(&with_breaks, "");
    let text = normalize_text(&unescape_entities(&stripped));
    (title, text)
}

fn unescape_entities(s: &str) -> String {
    let mut out = s
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'");
    // Numeric entities, decimal only; anything fancier stays as-is.
    static RE_NUM: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"&#(\d+);").expect("numeric entity pattern"));
    out = RE_NUM
        .replace_all(&out, |caps: &regex::Captures| {
            caps[1]
                .parse::<u32>()
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();
    // &amp; last so it cannot re-introduce entities.
    out.replace("&amp;", "&")
}

/// Collapse inner whitespace and runs of blank lines.
pub fn normalize_text(s: &str) -> String {
    let s = s.replace("\r\n", "\n").replace('\r', "\n");
    let mut out: Vec<String> = Vec::new();
    let mut blank = 0;
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank += 1;
            if blank <= 1 {
                out.push(String::new());
            }
            continue;
        }
        blank = 0;
        out.push(line.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    out.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_html() {
        assert!(looks_like_html(b"<!DOCTYPE html><html></html>"));
        assert!(looks_like_html(b"  <html lang=\"en\">"));
        assert!(!looks_like_html(b"{\"key\": \"value\"}"));
    }

    #[test]
    fn extracts_title_and_text() {
        let src = r#"<html><head><title>My Page</title>
            <style>body { color: red }</style></head>
            <body><script>alert(1)</script>
            <h1>Heading</h1><p>First &amp; second.</p>
            <div>Third   line</div></body></html>"#;
        let (title, text) = extract_html_text(src);
        assert_eq!(title, "My Page");
        assert!(!text.contains("alert"));
        assert!(!text.contains("color: red"));
        assert!(text.contains("Heading"));
        assert!(text.contains("First & second."));
        assert!(text.contains("Third line"));
    }

    #[test]
    fn normalize_collapses_blank_runs() {
        let s = "a\n\n\n\nb\n   c   d\n";
        assert_eq!(normalize_text(s), "a\n\nb\nc d");
    }

    #[test]
    fn numeric_entities_unescape() {
        assert_eq!(unescape_entities("caf&#233;"), "café");
        assert_eq!(unescape_entities("&amp;lt;"), "&lt;");
    }
}
