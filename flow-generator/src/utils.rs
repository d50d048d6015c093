/// Text helpers. Lengths are in characters, never bytes.
pub mod text {
    pub fn char_len(text: &str) -> usize {
        text.chars().count()
    }

    /// The first `n` characters of `text`.
    pub fn take_chars(text: &str, n: usize) -> &str {
        match text.char_indices().nth(n) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }

    /// Collapses runs of spaces and tabs, trims each line and drops repeated blank lines.
    pub fn collapse_whitespace(text: &str) -> String {
        let mut out: Vec<String> = Vec::new();
        let mut blank = false;
        for line in text.lines() {
            let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
            if line.is_empty() {
                if !blank && !out.is_empty() {
                    out.push(String::new());
                }
                blank = true;
            } else {
                out.push(line);
                blank = false;
            }
        }
        while out.last().is_some_and(|l| l.is_empty()) {
            out.pop();
        }
        out.join("\n")
    }
}

/// URL utilities
pub mod url {
    use url::Url;

    /// Extract domain from URL
    pub fn extract_domain(url_str: &str) -> Option<String> {
        Url::parse(url_str)
            .ok()
            .and_then(|url| url.domain().map(|d| d.to_string()))
    }

    pub fn is_http_url(url_str: &str) -> bool {
        match Url::parse(url_str) {
            Ok(url) => url.scheme() == "http" || url.scheme() == "https",
            Err(_) => false,
        }
    }

    /// `scheme://host[:port]` of a URL.
    pub fn site_root(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        })
    }

    /// Resolves a possibly relative reference against a page URL.
    pub fn resolve(base: &str, href: &str) -> Option<String> {
        let href = href.trim();
        if href.is_empty() || href.starts_with("data:") || href.starts_with("javascript:") {
            return None;
        }
        let base = Url::parse(base).ok()?;
        base.join(href).ok().map(|u| u.to_string())
    }

    /// Path extension in lowercase, ignoring the query string.
    pub fn path_extension(url_str: &str) -> Option<String> {
        let path = match Url::parse(url_str) {
            Ok(url) => url.path().to_string(),
            Err(_) => url_str.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        let file = path.rsplit('/').next()?;
        let (_, ext) = file.rsplit_once('.')?;
        if ext.is_empty() || ext.len() > 5 {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

/// HTML to text helpers
pub mod html {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static NUMERIC_ENTITY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("valid regex"));
    static NOISE_BLOCKS: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?is)<(script|style|noscript|nav|header|footer|aside|form|svg|iframe)\b[^>]*>.*?</(script|style|noscript|nav|header|footer|aside|form|svg|iframe)>")
            .expect("valid regex")
    });
    static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
    static BLOCK_BREAKS: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)<br\s*/?>|</(p|div|h[1-6]|li|blockquote|tr|section|article)>").expect("valid regex")
    });
    static MARKUP: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"</?([a-zA-Z][a-zA-Z0-9-]*)\b[^<>]*>|&(?:#[0-9]+|#x[0-9a-fA-F]+|[a-zA-Z][a-zA-Z0-9]*);")
            .expect("valid regex")
    });

    enum Token<'a> {
        Open { raw: &'a str, name: String },
        Close { name: String },
        /// One character, an entity or a void tag.
        Atom(&'a str),
    }

    struct Cut<'a> {
        bytes: usize,
        stack: Vec<(&'a str, String)>,
        next: usize,
    }

    /// Extract clean text content from HTML, all on one line
    pub fn extract_text_from_html(html: &str) -> String {
        let stripped = strip_tags(html);
        decode_entities(&stripped)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Readable text of an HTML fragment with paragraph breaks kept.
    pub fn html_to_text(html: &str) -> String {
        let html = COMMENTS.replace_all(html, "");
        let html = NOISE_BLOCKS.replace_all(&html, "");
        let html = BLOCK_BREAKS.replace_all(&html, "\n");
        let text = decode_entities(&strip_tags(&html));
        let lines: Vec<String> = text
            .lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect();
        lines.join("\n")
    }

    fn tokenize(text: &str) -> Vec<Token<'_>> {
        fn push_chars<'a>(tokens: &mut Vec<Token<'a>>, text: &'a str) {
            tokens.extend(
                text.char_indices()
                    .map(|(i, c)| Token::Atom(&text[i..i + c.len_utf8()])),
            );
        }

        let mut tokens = Vec::new();
        let mut last = 0;
        for caps in MARKUP.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            push_chars(&mut tokens, &text[last..whole.start()]);
            let raw = whole.as_str();
            tokens.push(match caps.get(1) {
                Some(name) => {
                    let name = name.as_str().to_ascii_lowercase();
                    if raw.starts_with("</") {
                        Token::Close { name }
                    } else if raw.ends_with("/>") || name == "br" {
                        Token::Atom(raw)
                    } else {
                        Token::Open { raw, name }
                    }
                }
                None => Token::Atom(raw),
            });
            last = whole.end();
        }
        push_chars(&mut tokens, &text[last..]);
        tokens
    }

    fn closing_len(name: &str) -> usize {
        name.len() + 3
    }

    /// Splits HTML message text into pieces of at most `limit` characters,
    /// markup included. Tags and entities are never cut; tags still open at a
    /// cut are closed there and reopened at the start of the next piece. Cuts
    /// prefer a line or word break in the second half of a piece.
    pub fn split_markup(text: &str, limit: usize) -> Vec<String> {
        let limit = limit.max(1);
        let tokens = tokenize(text.trim());
        let mut pieces = Vec::new();
        let mut open: Vec<(&str, String)> = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let start = i;
            let mut stack = open.clone();
            let mut buf: String = stack.iter().map(|(raw, _)| *raw).collect();
            let mut used = super::text::char_len(&buf);
            let mut fallback: Option<Cut> = None;

            while i < tokens.len() {
                let reserve: usize = stack.iter().map(|(_, name)| closing_len(name)).sum();
                let need = match &tokens[i] {
                    Token::Open { raw, name } => super::text::char_len(raw) + closing_len(name),
                    Token::Close { .. } => 0,
                    Token::Atom(raw) => super::text::char_len(raw),
                };
                if i > start && used + need + reserve > limit {
                    break;
                }
                match &tokens[i] {
                    Token::Open { raw, name } => {
                        buf.push_str(raw);
                        used += super::text::char_len(raw);
                        stack.push((*raw, name.clone()));
                    }
                    Token::Close { name } => {
                        // stray closing tags are dropped
                        if let Some(pos) = stack.iter().rposition(|(_, n)| n == name) {
                            for (_, n) in stack.drain(pos..).rev() {
                                buf.push_str(&format!("</{}>", n));
                                used += closing_len(&n);
                            }
                        }
                    }
                    Token::Atom(raw) => {
                        buf.push_str(raw);
                        used += super::text::char_len(raw);
                        if raw.trim().is_empty() && used * 2 > limit {
                            fallback = Some(Cut {
                                bytes: buf.len(),
                                stack: stack.clone(),
                                next: i + 1,
                            });
                        }
                    }
                }
                i += 1;
            }

            if i < tokens.len() {
                if let Some(cut) = fallback {
                    buf.truncate(cut.bytes);
                    stack = cut.stack;
                    i = cut.next;
                }
            }

            let mut piece = buf.trim_end().to_string();
            for (_, name) in stack.iter().rev() {
                piece.push_str(&format!("</{}>", name));
            }
            if !strip_tags(&piece).trim().is_empty() {
                pieces.push(piece);
            }
            open = stack;
            while matches!(tokens.get(i), Some(Token::Atom(raw)) if raw.trim().is_empty()) {
                i += 1;
            }
        }

        pieces
    }

    /// The first piece of [`split_markup`].
    pub fn truncate_markup(text: &str, limit: usize) -> String {
        split_markup(text, limit).into_iter().next().unwrap_or_default()
    }

    pub fn strip_tags(html: &str) -> String {
        html.chars()
            .fold((String::new(), false), |(mut text, in_tag), c| match c {
                '<' => (text, true),
                '>' if in_tag => {
                    text.push(' ');
                    (text, false)
                }
                _ if !in_tag => {
                    text.push(c);
                    (text, in_tag)
                }
                _ => (text, in_tag),
            })
            .0
    }

    pub fn decode_entities(text: &str) -> String {
        let named = text
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&mdash;", "\u{2014}")
            .replace("&ndash;", "\u{2013}")
            .replace("&hellip;", "\u{2026}");
        let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures| {
            let raw = &caps[1];
            let code = match raw.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => raw.parse::<u32>().ok(),
            };
            code.and_then(char::from_u32)
                .map(|c| c.to_string())
                .unwrap_or_default()
        });
        // last, so "&amp;lt;" stays "&lt;"
        numeric.replace("&amp;", "&")
    }
}

/// Natural keys
pub mod keys {
    use sha2::{Digest, Sha256};

    /// `<prefix>_<first 32 hex chars of sha256(input)>`.
    pub fn digest_key(prefix: &str, input: &str) -> String {
        let digest = hex::encode(Sha256::digest(input.as_bytes()));
        format!("{}_{}", prefix, &digest[..32])
    }
}

/// Time utilities
pub mod time {
    use chrono::Duration;

    /// Format duration in human-readable form
    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.num_seconds();

        if total_seconds < 60 {
            format!("{}s", total_seconds)
        } else if total_seconds < 3600 {
            format!("{}m", total_seconds / 60)
        } else if total_seconds < 86400 {
            format!("{}h", total_seconds / 3600)
        } else {
            format!("{}d", total_seconds / 86400)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balanced(piece: &str) -> bool {
        piece.matches("<b>").count() == piece.matches("</b>").count()
            && piece.matches("<i>").count() == piece.matches("</i>").count()
    }

    #[test]
    fn markup_pieces_respect_limit_in_chars() {
        let text = "привет мир ".repeat(50);
        let pieces = html::split_markup(&text, 40);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| text::char_len(p) <= 40));
        assert_eq!(
            pieces.join(" ").split_whitespace().count(),
            text.split_whitespace().count()
        );
    }

    #[test]
    fn markup_pieces_never_cut_inside_a_tag() {
        let text = format!("<b>Breaking headline</b>\n\n{}", "<b>x</b> ".repeat(40));
        for limit in [9, 20, 33, 64] {
            for piece in html::split_markup(&text, limit) {
                assert!(text::char_len(&piece) <= limit, "{:?} over {}", piece, limit);
                assert!(balanced(&piece), "unbalanced {:?}", piece);
                assert_eq!(piece.matches('<').count(), piece.matches('>').count());
            }
        }
    }

    #[test]
    fn bold_run_across_a_cut_is_closed_and_reopened() {
        let text = format!("<b>{}</b> tail", "bold ".repeat(20).trim_end());
        let pieces = html::split_markup(&text, 40);
        assert!(pieces.len() > 2);
        assert!(pieces[0].starts_with("<b>") && pieces[0].ends_with("</b>"));
        assert!(pieces[1].starts_with("<b>") && pieces[1].ends_with("</b>"));
        assert!(pieces.iter().all(|p| balanced(p) && text::char_len(p) <= 40));
        assert_eq!(
            html::extract_text_from_html(&pieces.join(" ")),
            html::extract_text_from_html(&text)
        );
    }

    #[test]
    fn entities_stay_whole() {
        let text = "a&amp;b ".repeat(10);
        let caption = html::truncate_markup(&text, 12);
        assert_eq!(caption, "a&amp;b");
        assert_eq!(html::truncate_markup(&"&lt;".repeat(10), 10), "&lt;&lt;");
    }

    #[test]
    fn nested_tags_close_in_order() {
        let caption = html::truncate_markup("<b>bold <i>both words here</i> more</b>", 24);
        assert!(balanced(&caption));
        assert!(caption.ends_with("</i></b>"), "{}", caption);
        assert!(text::char_len(&caption) <= 24);
    }

    #[test]
    fn take_chars_is_boundary_safe() {
        assert_eq!(text::take_chars("héllo", 2), "hé");
        assert_eq!(text::take_chars("hi", 10), "hi");
    }

    #[test]
    fn html_text_keeps_paragraphs_and_drops_scripts() {
        let html = "<p>One &amp; two</p><script>var x = 1;</script><p>Three&nbsp;four &#8230;</p>";
        assert_eq!(html::html_to_text(html), "One & two\nThree four \u{2026}");
        assert_eq!(html::extract_text_from_html("<b>a</b>b"), "a b");
    }

    #[test]
    fn url_helpers() {
        assert_eq!(
            url::site_root("https://example.com:8080/a/b?c=1").as_deref(),
            Some("https://example.com:8080")
        );
        assert_eq!(
            url::resolve("https://example.com/news/item", "/img/a.jpg").as_deref(),
            Some("https://example.com/img/a.jpg")
        );
        assert_eq!(url::resolve("https://example.com/", "data:image/png;base64,AA"), None);
        assert_eq!(url::path_extension("https://x.io/a/photo.JPG?w=10").as_deref(), Some("jpg"));
        assert_eq!(url::path_extension("https://x.io/a/photo"), None);
    }

    #[test]
    fn digest_keys_are_stable() {
        let a = keys::digest_key("rss", "https://example.com/a");
        assert_eq!(a, keys::digest_key("rss", "https://example.com/a"));
        assert_ne!(a, keys::digest_key("rss", "https://example.com/b"));
        assert_eq!(a.len(), "rss_".len() + 32);
    }

    #[test]
    fn collapse_whitespace_keeps_single_blank_lines() {
        assert_eq!(text::collapse_whitespace("  a   b \n\n\n c\t\td \n"), "a b\n\nc d");
    }
}
