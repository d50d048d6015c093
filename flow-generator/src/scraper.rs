use crate::bypass::BypassFetcher;
use crate::config::ScraperConfig;
use crate::fetcher::Fetcher;
use crate::utils;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

static ARTICLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<article\b[^>]*>(.*?)</article>").expect("valid regex"));
static MAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<main\b[^>]*>(.*?)</main>").expect("valid regex"));
static MAIN_CONTENT_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<[a-z]+\b[^>]*\bclass\s*=\s*["'][^"']*\bmain-content\b[^"']*["'][^>]*>"#).expect("valid regex")
});
static BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<body\b[^>]*>(.*)</body>").expect("valid regex"));
static BODY_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</body>").expect("valid regex"));
static TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("valid regex"));
static META: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid regex"));
static IMG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").expect("valid regex"));
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)([a-zA-Z][a-zA-Z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

const DECORATIVE: &[&str] = &[
    "icon", "logo", "button", "sprite", "banner", "avatar", "pixel", "badge",
];

#[derive(Debug, Clone, Default)]
pub struct ScrapedPage {
    pub title: Option<String>,
    pub text: String,
    pub images: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Pulls the readable article out of an entry page.
pub struct ArticleScraper {
    fetcher: Arc<Fetcher>,
    bypass: Arc<BypassFetcher>,
    config: ScraperConfig,
}

impl ArticleScraper {
    pub fn new(fetcher: Arc<Fetcher>, bypass: Arc<BypassFetcher>, config: ScraperConfig) -> Self {
        Self {
            fetcher,
            bypass,
            config,
        }
    }

    pub async fn scrape(&self, url: &str) -> Option<ScrapedPage> {
        let html = self.fetch_html(url).await?;
        let page = extract_page(url, &html, &self.config);
        debug!("Scraped {}: {} chars, {} images", url, page.text.len(), page.images.len());
        Some(page)
    }

    async fn fetch_html(&self, url: &str) -> Option<String> {
        let result = match self.fetcher.fetch(url).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Scrape of {} failed: {}", url, e);
                return None;
            }
        };

        if result.success {
            return result.content;
        }
        if result.is_blocked() {
            debug!("{} answered {:?}, trying bypass", url, result.http_status);
            let html = self.bypass.get_page_content(url).await;
            let (ok, failed) = self.bypass.stats();
            debug!("Bypass totals: {} ok, {} failed", ok, failed);
            return html;
        }
        warn!("Scrape of {} failed: {}", url, result.error.unwrap_or_default());
        None
    }
}

pub fn extract_page(url: &str, html: &str, config: &ScraperConfig) -> ScrapedPage {
    let metas = meta_tags(html);
    let title = metas
        .get("og:title")
        .cloned()
        .or_else(|| TITLE.captures(html).map(|c| utils::html::extract_text_from_html(&c[1])))
        .filter(|t| !t.is_empty());
    let published_at = metas
        .get("article:published_time")
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let content = main_content(html);
    ScrapedPage {
        title,
        text: utils::html::html_to_text(content),
        images: extract_images(content, url, config),
        published_at,
    }
}

/// `<article>`, then `<main>`, then `.main-content`, then `<body>`, then everything.
pub fn main_content(html: &str) -> &str {
    if let Some(m) = ARTICLE.captures(html).and_then(|c| c.get(1)) {
        return m.as_str();
    }
    if let Some(m) = MAIN.captures(html).and_then(|c| c.get(1)) {
        return m.as_str();
    }
    if let Some(open) = MAIN_CONTENT_OPEN.find(html) {
        let rest = &html[open.end()..];
        let end = BODY_CLOSE.find(rest).map(|m| m.start()).unwrap_or(rest.len());
        return &rest[..end];
    }
    if let Some(m) = BODY.captures(html).and_then(|c| c.get(1)) {
        return m.as_str();
    }
    html
}

/// Qualifying images of a fragment, resolved against the page URL.
pub fn extract_images(html: &str, page_url: &str, config: &ScraperConfig) -> Vec<String> {
    let mut images = Vec::new();
    for tag in IMG.find_iter(html) {
        if images.len() >= config.max_images {
            break;
        }
        let attrs = attributes(tag.as_str());
        let Some(src) = ["data-src", "data-lazy-src", "src"]
            .iter()
            .find_map(|k| attrs.get(*k))
            .filter(|s| !s.starts_with("data:"))
        else {
            continue;
        };
        let Some(resolved) = utils::url::resolve(page_url, src) else {
            continue;
        };
        if utils::url::path_extension(&resolved).as_deref() == Some("svg") {
            continue;
        }
        if is_too_small(&attrs, config) || is_decorative(&attrs, &resolved) {
            continue;
        }
        if !images.contains(&resolved) {
            images.push(resolved);
        }
    }
    images
}

fn attributes(tag: &str) -> HashMap<String, String> {
    ATTR.captures_iter(tag)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map(|m| m.as_str()).unwrap_or_default();
            (c[1].to_ascii_lowercase(), utils::html::decode_entities(value))
        })
        .collect()
}

fn meta_tags(html: &str) -> HashMap<String, String> {
    let mut metas = HashMap::new();
    for tag in META.find_iter(html) {
        let attrs = attributes(tag.as_str());
        let key = attrs.get("property").or_else(|| attrs.get("name"));
        if let (Some(key), Some(content)) = (key, attrs.get("content")) {
            metas.entry(key.to_ascii_lowercase()).or_insert_with(|| content.clone());
        }
    }
    metas
}

/// Declared dimensions below the minimum disqualify an image; undeclared ones don't.
fn is_too_small(attrs: &HashMap<String, String>, config: &ScraperConfig) -> bool {
    let dim = |key: &str| {
        attrs.get(key).and_then(|v| {
            let digits: String = v.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            if v.contains('%') {
                None
            } else {
                digits.parse::<u32>().ok()
            }
        })
    };
    let narrow = dim("width").map(|w| w < config.min_image_width).unwrap_or(false);
    let short = dim("height").map(|h| h < config.min_image_height).unwrap_or(false);
    narrow || short
}

fn is_decorative(attrs: &HashMap<String, String>, src: &str) -> bool {
    let filename = src
        .split(['?', '#'])
        .next()
        .unwrap_or(src)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string();
    let haystacks = [
        attrs.get("class").cloned().unwrap_or_default(),
        attrs.get("alt").cloned().unwrap_or_default(),
        attrs.get("id").cloned().unwrap_or_default(),
        filename,
    ];

    haystacks.iter().any(|text| {
        let lower = text.to_lowercase();
        if DECORATIVE.iter().any(|d| lower.contains(d)) {
            return true;
        }
        lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "ad" || token == "ads")
    })
}
