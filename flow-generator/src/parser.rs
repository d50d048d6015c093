use crate::types::{GeneratorError, ParsedEntry, ParsedFeed, Result};
use crate::utils;
use feed_rs::parser;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, info};

static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("valid regex"));

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "avif"];

#[derive(Default)]
pub struct FeedParser;

impl FeedParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_feed(&self, content: &str) -> Result<ParsedFeed> {
        debug!("Parsing feed content ({} bytes)", content.len());

        let feed = parser::parse(content.as_bytes())
            .map_err(|e| GeneratorError::Parse(format!("Failed to parse feed: {}", e)))?;

        let title = feed.title.map(|t| t.content);
        let description = feed.description.map(|d| d.content);

        let mut seen_guids = HashSet::new();
        let mut seen_urls = HashSet::new();
        let mut entries = Vec::new();

        for entry in feed.entries {
            let Some(parsed) = Self::parse_entry(entry) else {
                continue;
            };
            if let Some(ref guid) = parsed.guid {
                if !seen_guids.insert(guid.clone()) {
                    debug!("Skipping duplicate entry with GUID: {}", guid);
                    continue;
                }
            }
            if !seen_urls.insert(parsed.url.clone()) {
                debug!("Skipping duplicate entry with URL: {}", parsed.url);
                continue;
            }
            entries.push(parsed);
        }

        info!("Parsed feed with {} entries", entries.len());

        Ok(ParsedFeed {
            title,
            description,
            entries,
        })
    }

    fn parse_entry(entry: feed_rs::model::Entry) -> Option<ParsedEntry> {
        let title = entry
            .title
            .map(|t| utils::html::extract_text_from_html(&t.content))
            .unwrap_or_default();

        let url = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or_else(|| entry.links.first())?
            .href
            .clone();

        let guid = if entry.id.is_empty() {
            None
        } else {
            Some(entry.id.clone())
        };

        let summary = entry.summary.map(|s| s.content);
        let content = entry.content.and_then(|c| c.body);

        let mut images: Vec<String> = Vec::new();
        let mut push = |candidate: String, declared_image: bool| {
            let candidate = match utils::url::resolve(&url, &candidate) {
                Some(c) => c,
                None => return,
            };
            if is_svg(&candidate) || images.contains(&candidate) {
                return;
            }
            if declared_image || looks_like_image_url(&candidate) {
                images.push(candidate);
            }
        };

        for media in &entry.media {
            for item in &media.content {
                let Some(ref media_url) = item.url else { continue };
                let declared = item
                    .content_type
                    .as_ref()
                    .map(|m| m.to_string().starts_with("image/"))
                    .unwrap_or(false);
                push(media_url.to_string(), declared);
            }
            for thumb in &media.thumbnails {
                push(thumb.image.uri.clone(), true);
            }
        }
        for link in &entry.links {
            if link.rel.as_deref() == Some("enclosure") {
                let declared = link
                    .media_type
                    .as_deref()
                    .map(|t| t.starts_with("image/"))
                    .unwrap_or(false);
                if declared {
                    push(link.href.clone(), true);
                }
            }
        }
        for html in summary.iter().chain(content.iter()) {
            for caps in IMG_SRC.captures_iter(html) {
                push(caps[1].to_string(), false);
            }
        }

        let published_at = entry.published.or(entry.updated);

        Some(ParsedEntry {
            guid,
            url,
            title,
            summary,
            content,
            published_at,
            images,
        })
    }

    pub fn is_valid_feed_content(content: &str) -> bool {
        let content_lower = content.to_lowercase();

        let has_rss_indicators = content_lower.contains("<rss")
            || content_lower.contains("<feed")
            || content_lower.contains("xmlns=\"http://www.w3.org/2005/atom\"")
            || content_lower.contains("xmlns:atom")
            || content_lower.contains("<channel");

        let has_xml_declaration = content.trim_start().starts_with("<?xml");

        has_rss_indicators && (has_xml_declaration || content_lower.contains("<"))
    }
}

fn is_svg(url: &str) -> bool {
    utils::url::path_extension(url).as_deref() == Some("svg")
}

/// Heuristic for image URLs that carry no declared content type.
pub fn looks_like_image_url(url: &str) -> bool {
    if let Some(ext) = utils::url::path_extension(url) {
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
    }
    let lower = url.to_lowercase();
    if ["/media/", "/images/", "/img/", "/uploads/"]
        .iter()
        .any(|p| lower.contains(p))
    {
        return true;
    }
    utils::url::extract_domain(url)
        .map(|d| d.starts_with("cdn.") || d.starts_with("images.") || d.starts_with("img."))
        .unwrap_or(false)
}
