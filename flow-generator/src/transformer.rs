use crate::config::TransformConfig;
use crate::llm_adapter::{LlmClient, LlmError};
use crate::traits::Notifier;
use crate::types::{Flow, GeneratorError, Result};
use crate::utils::text::{char_len, collapse_whitespace, take_chars};
use backoff::{backoff::Backoff, exponential::ExponentialBackoff};
use futures::future::join_all;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

static HIDDEN_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\u{200B}-\u{200D}\u{FEFF}]").expect("valid regex"));
static URLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+|www\.\S+").expect("valid regex"));
static MARKDOWN_LINKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("valid regex"));
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));

const ELLIPSIS: char = '\u{2026}';

/// Cleans text before and after the LLM: hidden and control characters, links
/// and URLs go, `**bold**` becomes `<b>bold</b>`, whitespace is collapsed.
pub fn normalize(text: &str) -> String {
    let text = HIDDEN_CHARS.replace_all(text, "");
    let text: String = text
        .chars()
        .map(|c| if c == '\t' || c == '\r' { ' ' } else { c })
        .filter(|c| *c == '\n' || !c.is_control())
        .collect();
    let text = MARKDOWN_LINKS.replace_all(&text, "$1");
    let text = URLS.replace_all(&text, "");
    let text = BOLD.replace_all(&text, "<b>$1</b>");
    collapse_whitespace(&text)
}

/// Deterministic system prompt for a flow. A custom prompt replaces it entirely.
pub fn build_system_prompt(flow: &Flow) -> String {
    if let Some(custom) = flow.custom_prompt.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        return custom.to_string();
    }

    let style = &flow.style;
    let mut rules = vec!["You are a professional post editor.".to_string()];
    if flow.theme.trim().is_empty() {
        rules.push("Rewrite the text below as a post for a channel.".to_string());
    } else {
        rules.push(format!(
            "Rewrite the text below as a post for a channel about \"{}\".",
            flow.theme.trim()
        ));
    }
    rules.push(format!(
        "The post must be no longer than {} characters.",
        flow.content_length.max_chars()
    ));
    rules.push(
        if style.use_premium_emojis {
            "Use premium emojis where they fit the content."
        } else if style.use_emojis {
            "Use emojis where they fit the content."
        } else {
            "Do not use emojis."
        }
        .to_string(),
    );
    if style.title_highlight {
        rules.push("Start with a short title wrapped in <b></b> tags.".to_string());
    }
    if let Some(cta) = style.cta.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        rules.push(format!("End the post with this call to action: {}", cta));
    }
    rules.push("Keep the facts of the original. Do not add links or hashtags.".to_string());
    rules.push("Return only the edited content without commentary.".to_string());
    rules.join("\n")
}

/// Cuts text to at most `max_chars` characters: at a sentence end at or past 70% of
/// the limit, else at a word break at or past 80% with an ellipsis, else hard with an ellipsis.
pub fn enforce_length_limit(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if char_len(text) <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let window: Vec<char> = take_chars(text, max_chars).chars().collect();
    let sentence_floor = max_chars as f64 * 0.7;
    let sentence_end = window
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match c {
            '.' | '!' | '?' if window.get(i + 1) == Some(&' ') => Some(i + 1),
            '\n' => Some(i),
            _ => None,
        })
        .filter(|&keep| keep as f64 >= sentence_floor)
        .last();
    if let Some(keep) = sentence_end {
        return window[..keep].iter().collect::<String>().trim_end().to_string();
    }

    let room = &window[..max_chars - 1];
    let word_floor = max_chars as f64 * 0.8;
    let word_end = room
        .iter()
        .rposition(|c| *c == ' ')
        .filter(|&i| i as f64 >= word_floor);
    let kept: String = match word_end {
        Some(i) => room[..i].iter().collect(),
        None => room.iter().collect(),
    };
    let mut out = kept.trim_end().to_string();
    out.push(ELLIPSIS);
    out
}

/// Rewrites raw text for a flow through the LLM, with retries and a bounded cache.
pub struct ContentTransformer {
    llm: Arc<dyn LlmClient>,
    notifier: Arc<dyn Notifier>,
    config: TransformConfig,
    cache: Mutex<IndexMap<(String, Uuid), String>>,
}

impl ContentTransformer {
    pub fn new(llm: Arc<dyn LlmClient>, notifier: Arc<dyn Notifier>, config: TransformConfig) -> Self {
        info!("Content transformer using {}", llm.adapter_name());
        Self {
            llm,
            notifier,
            config,
            cache: Mutex::new(IndexMap::new()),
        }
    }

    /// Transforms one text. Failure is returned, not alerted.
    pub async fn transform(&self, flow: &Flow, text: &str) -> Result<String> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Ok(String::new());
        }

        let key = (normalized, flow.id);
        if let Some(hit) = self.cache.lock().await.get(&key) {
            debug!("Transform cache hit for flow {}", flow.id);
            return Ok(hit.clone());
        }

        let prompt = build_system_prompt(flow);
        let completion = self
            .call_with_retry(&prompt, &key.0)
            .await
            .map_err(|e| GeneratorError::TransformFailed(e.to_string()))?;
        let cleaned = normalize(&completion);
        if cleaned.is_empty() {
            return Err(GeneratorError::TransformFailed("empty completion".to_string()));
        }
        let bounded = enforce_length_limit(&cleaned, flow.content_length.max_chars());

        let mut cache = self.cache.lock().await;
        if self.config.cache_capacity > 0 {
            while cache.len() >= self.config.cache_capacity {
                cache.shift_remove_index(0);
            }
            cache.insert(key, bounded.clone());
        }
        Ok(bounded)
    }

    /// Single text; on failure operators are alerted and `None` is returned.
    pub async fn process(&self, flow: &Flow, text: &str) -> Option<String> {
        self.process_batch(flow, &[text.to_string()]).await.pop().flatten()
    }

    /// Transforms in groups, pausing between groups. Failed entries come back as
    /// `None`; one alert covers all failures of the batch.
    pub async fn process_batch(&self, flow: &Flow, texts: &[String]) -> Vec<Option<String>> {
        let mut results = Vec::with_capacity(texts.len());
        let mut failures: Vec<String> = Vec::new();

        for (i, group) in texts.chunks(self.config.batch_size.max(1)).enumerate() {
            if i > 0 && self.config.batch_pause_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.batch_pause_ms)).await;
            }
            let outcomes = join_all(group.iter().map(|text| self.transform(flow, text))).await;
            for outcome in outcomes {
                match outcome {
                    Ok(text) => results.push(Some(text)),
                    Err(e) => {
                        warn!("Transform failed for flow {}: {}", flow.id, e);
                        failures.push(e.to_string());
                        results.push(None);
                    }
                }
            }
        }

        if let Some(first) = failures.first() {
            let message = format!(
                "Content transformation failed for {} of {} posts in flow \"{}\" ({}): {}",
                failures.len(),
                texts.len(),
                flow.name,
                flow.id,
                first
            );
            if let Err(e) = self.notifier.alert_operators(&message).await {
                warn!("Failed to alert operators: {}", e);
            }
        }

        results
    }

    async fn call_with_retry(&self, prompt: &str, text: &str) -> std::result::Result<String, LlmError> {
        let cap = Duration::from_millis(self.config.rate_limit_cap_ms);
        let mut rate_backoff: ExponentialBackoff<backoff::SystemClock> = ExponentialBackoff {
            current_interval: cap.min(Duration::from_secs(1)),
            initial_interval: cap.min(Duration::from_secs(1)),
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: cap,
            max_elapsed_time: None,
            ..Default::default()
        };

        let attempts = self.config.retries();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.llm.complete(prompt, text).await {
                Ok(completion) => return Ok(completion),
                Err(e) => e,
            };
            if !error.is_retryable() || attempt >= attempts {
                return Err(error);
            }

            let wait = match &error {
                LlmError::RateLimited { retry_after } => retry_after
                    .or_else(|| rate_backoff.next_backoff())
                    .unwrap_or(cap)
                    .min(cap),
                _ => Duration::from_millis(self.config.api_error_delay_ms),
            };
            warn!("LLM attempt {}/{} failed ({}), retrying in {:?}", attempt, attempts, error, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_adapter::MockLlmAdapter;
    use crate::notifier::RecordingNotifier;
    use crate::types::{ContentLength, StyleFlags};

    fn flow() -> Flow {
        let mut flow = Flow::new(Uuid::new_v4(), "Tech", "@tech");
        flow.theme = "technology".to_string();
        flow.content_length = ContentLength::To300;
        flow
    }

    #[test]
    fn normalize_strips_links_and_hidden_chars() {
        let raw = "Hello\u{200B} **world**! See [the docs](https://x.io/a) at https://x.io/b and www.y.com\n\n\n\nBye\u{7}";
        assert_eq!(normalize(raw), "Hello <b>world</b>! See the docs at and\n\nBye");
    }

    #[test]
    fn prompt_reflects_style_flags() {
        let mut flow = flow();
        flow.style = StyleFlags {
            use_emojis: true,
            use_premium_emojis: false,
            title_highlight: true,
            cta: Some("Subscribe!".to_string()),
        };
        let prompt = build_system_prompt(&flow);
        assert!(prompt.starts_with("You are a professional post editor."));
        assert!(prompt.contains("\"technology\""));
        assert!(prompt.contains("300 characters"));
        assert!(prompt.contains("Use emojis"));
        assert!(prompt.contains("<b></b>"));
        assert!(prompt.contains("Subscribe!"));
        assert!(prompt.ends_with("Return only the edited content without commentary."));
        assert_eq!(prompt, build_system_prompt(&flow));

        flow.custom_prompt = Some("  Write like a pirate.  ".to_string());
        assert_eq!(build_system_prompt(&flow), "Write like a pirate.");
    }

    #[test]
    fn cuts_at_sentence_end_past_seventy_percent() {
        let text = format!("{}. {}", "a".repeat(80), "b".repeat(50));
        assert_eq!(enforce_length_limit(&text, 100), format!("{}.", "a".repeat(80)));
    }

    #[test]
    fn cuts_at_word_break_with_ellipsis() {
        let text = format!("{} {}", "a".repeat(85), "b".repeat(50));
        assert_eq!(enforce_length_limit(&text, 100), format!("{}\u{2026}", "a".repeat(85)));
    }

    #[test]
    fn sentence_ending_exactly_at_seventy_percent_is_kept() {
        let text = format!("{}. {}", "a".repeat(69), "b".repeat(60));
        assert_eq!(enforce_length_limit(&text, 100), format!("{}.", "a".repeat(69)));
    }

    #[test]
    fn word_break_exactly_at_eighty_percent_is_used() {
        let text = format!("{} {}", "a".repeat(80), "b".repeat(60));
        assert_eq!(enforce_length_limit(&text, 100), format!("{}\u{2026}", "a".repeat(80)));
    }

    #[test]
    fn hard_cut_with_ellipsis() {
        let text = "x".repeat(150);
        let out = enforce_length_limit(&text, 100);
        assert_eq!(char_len(&out), 100);
        assert!(out.ends_with('\u{2026}'));
    }

    #[test]
    fn length_bound_holds_for_multibyte_text() {
        let samples = [
            "Привет, мир! ".repeat(40),
            "短い文。".repeat(100),
            "word ".repeat(300),
            "emoji 🎉🎉 party. ".repeat(30),
            "line\n".repeat(200),
        ];
        for sample in &samples {
            for max in [1usize, 2, 10, 100, 300, 1000] {
                let out = enforce_length_limit(sample, max);
                assert!(char_len(&out) <= max, "{} > {} for {:?}", char_len(&out), max, take_chars(sample, 10));
            }
        }
    }

    #[test]
    fn short_text_untouched() {
        assert_eq!(enforce_length_limit("  short  ", 100), "short");
    }

    fn fast_config() -> TransformConfig {
        TransformConfig {
            batch_pause_ms: 0,
            api_error_delay_ms: 0,
            rate_limit_cap_ms: 10,
            ..Default::default()
        }
    }

    fn transformer(llm: Arc<MockLlmAdapter>, notifier: Arc<RecordingNotifier>, config: TransformConfig) -> ContentTransformer {
        ContentTransformer::new(llm, notifier, config)
    }

    #[tokio::test]
    async fn retries_after_rate_limit() {
        let llm = Arc::new(MockLlmAdapter::new("scripted").with_script(vec![
            Err(LlmError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            }),
            Ok("Rewritten **text**".to_string()),
        ]));
        let t = transformer(llm.clone(), Arc::new(RecordingNotifier::new()), fast_config());

        let out = t.transform(&flow(), "original").await.unwrap();
        assert_eq!(out, "Rewritten <b>text</b>");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let llm = Arc::new(MockLlmAdapter::failing("strict", LlmError::BadRequest("nope".into())));
        let t = transformer(llm.clone(), Arc::new(RecordingNotifier::new()), fast_config());

        assert!(t.transform(&flow(), "original").await.is_err());
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_batch_alerts_once() {
        let llm = Arc::new(MockLlmAdapter::failing(
            "down",
            LlmError::Api {
                status: 500,
                message: "overloaded".into(),
            },
        ));
        let notifier = Arc::new(RecordingNotifier::new());
        let t = transformer(llm.clone(), notifier.clone(), fast_config());
        let texts: Vec<String> = (0..3).map(|i| format!("text {}", i)).collect();

        let out = t.process_batch(&flow(), &texts).await;
        assert_eq!(out, vec![None, None, None]);
        assert_eq!(llm.call_count(), 9);
        assert_eq!(notifier.alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn cache_and_empty_input_skip_the_llm() {
        let llm = Arc::new(MockLlmAdapter::new("echo"));
        let t = transformer(llm.clone(), Arc::new(RecordingNotifier::new()), fast_config());
        let flow = flow();

        assert_eq!(t.transform(&flow, "  \u{200B} ").await.unwrap(), "");
        assert_eq!(llm.call_count(), 0);

        let first = t.transform(&flow, "Same story").await.unwrap();
        let second = t.transform(&flow, "Same   story").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn pauses_between_groups() {
        let llm = Arc::new(MockLlmAdapter::new("slow").with_delay(5));
        let config = TransformConfig {
            batch_size: 2,
            batch_pause_ms: 40,
            ..fast_config()
        };
        let t = transformer(llm.clone(), Arc::new(RecordingNotifier::new()), config);
        let texts: Vec<String> = (0..3).map(|i| format!("story {}", i)).collect();

        let started = std::time::Instant::now();
        let out = t.process_batch(&flow(), &texts).await;
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(out.iter().flatten().count(), 3);
        assert_eq!(out[2].as_deref(), Some("story 2"));
    }
}
