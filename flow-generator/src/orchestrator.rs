use crate::allocator;
use crate::config::RunConfig;
use crate::dedup::{DedupGate, InsertOutcome};
use crate::eviction::FlowVolumeEvictor;
use crate::media::MediaStore;
use crate::traits::{FlowRepository, Notifier, QuotaLedger, SourceReader};
use crate::transformer::ContentTransformer;
use crate::types::{Flow, GeneratorError, NewPost, Post, RawPost, Result, Source, TenantQuota};
use crate::utils;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    QuotaExceeded,
    NoSources,
    NoResults,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Allocating,
    Fetching,
    Transforming,
    Persisting,
    Evicting,
    Done,
    Failed(FailureReason),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Failed(reason) => write!(f, "Failed({:?})", reason),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Keep the most recent posts that fit the remaining quota instead of failing.
    pub allow_partial: bool,
    pub notify_chat_id: Option<i64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            allow_partial: true,
            notify_chat_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub link: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub flow_id: Uuid,
    pub state: RunState,
    pub posts: Vec<Post>,
    /// New items found across all sources, before transformation.
    pub candidates: usize,
    pub dropped_transform: usize,
    pub evicted: usize,
    pub quota_exhausted: bool,
    pub source_failures: Vec<SourceFailure>,
    pub next_generation_time: Option<DateTime<Utc>>,
}

impl RunReport {
    fn new(flow_id: Uuid) -> Self {
        Self {
            flow_id,
            state: RunState::Idle,
            posts: Vec::new(),
            candidates: 0,
            dropped_transform: 0,
            evicted: 0,
            quota_exhausted: false,
            source_failures: Vec::new(),
            next_generation_time: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }
}

/// Everything a generation run talks to.
pub struct GenerationDeps {
    pub flows: Arc<dyn FlowRepository>,
    pub quota: Arc<dyn QuotaLedger>,
    pub notifier: Arc<dyn Notifier>,
    pub channel_reader: Arc<dyn SourceReader>,
    pub web_reader: Arc<dyn SourceReader>,
    pub transformer: Arc<ContentTransformer>,
    pub media: Arc<MediaStore>,
    pub dedup: DedupGate,
    pub evictor: FlowVolumeEvictor,
}

/// Runs one generation pass for a flow: read sources, rewrite, persist, trim.
pub struct GenerationOrchestrator {
    deps: GenerationDeps,
    config: RunConfig,
}

impl GenerationOrchestrator {
    pub fn new(deps: GenerationDeps, config: RunConfig) -> Self {
        Self { deps, config }
    }

    pub async fn generate(&self, flow_id: Uuid, options: RunOptions) -> Result<RunReport> {
        let _run_lock = self
            .deps
            .flows
            .try_lock_flow_run(flow_id)
            .await?
            .ok_or(GeneratorError::RunInProgress { flow_id })?;

        let flow = self
            .deps
            .flows
            .get_flow(flow_id)
            .await?
            .ok_or(GeneratorError::FlowNotFound { id: flow_id })?;

        let started = Instant::now();
        let now = Utc::now();
        let next = flow.frequency.next_after(now);
        let mut report = RunReport::new(flow_id);
        self.log_event(&format!("Generation started for flow \"{}\" ({})", flow.name, flow.id))
            .await;

        let quota = self.deps.quota.tenant_quota(flow.tenant_id).await?;
        if flow.sources.is_empty() {
            return self
                .fail(&flow, report, FailureReason::NoSources, &quota, next, &options)
                .await;
        }
        if quota.remaining() == Some(0) {
            return self
                .fail(&flow, report, FailureReason::QuotaExceeded, &quota, next, &options)
                .await;
        }

        self.transition(&flow, &mut report, RunState::Allocating);
        let allocation = allocator::allocate(flow.volume, &flow.sources);

        self.transition(&flow, &mut report, RunState::Fetching);
        let fetched = self.fetch_all(&flow, allocation, &mut report).await;
        let candidates = self.select_candidates(fetched).await?;
        report.candidates = candidates.len();
        if candidates.is_empty() {
            return self
                .fail(&flow, report, FailureReason::NoResults, &quota, next, &options)
                .await;
        }

        self.transition(&flow, &mut report, RunState::Transforming);
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let rewritten = self.deps.transformer.process_batch(&flow, &texts).await;
        let mut accepted: Vec<(RawPost, String)> = Vec::with_capacity(candidates.len());
        for (raw, content) in candidates.into_iter().zip(rewritten) {
            match content {
                Some(content) => accepted.push((raw, content)),
                None => {
                    warn!(flow_id = %flow.id, source = %raw.source_url, key = %raw.source_id, "Dropping item after failed transformation");
                    report.dropped_transform += 1;
                }
            }
        }
        if accepted.is_empty() {
            return self
                .fail(&flow, report, FailureReason::NoResults, &quota, next, &options)
                .await;
        }

        if let Some(remaining) = quota.remaining() {
            let remaining = remaining as usize;
            if accepted.len() > remaining {
                if !options.allow_partial {
                    return self
                        .fail(&flow, report, FailureReason::QuotaExceeded, &quota, next, &options)
                        .await;
                }
                info!(
                    flow_id = %flow.id,
                    "Quota allows {} of {} posts, keeping the most recent",
                    remaining,
                    accepted.len()
                );
                accepted.truncate(remaining);
                report.quota_exhausted = true;
            }
        }

        self.transition(&flow, &mut report, RunState::Persisting);
        report.posts = self.persist_all(&flow, accepted).await;

        self.transition(&flow, &mut report, RunState::Evicting);
        match self.deps.evictor.evict(&flow).await {
            Ok(evicted) => report.evicted = evicted,
            Err(e) => error!(flow_id = %flow.id, "Eviction failed: {}", e),
        }

        let persisted = report.posts.len() as u32;
        if persisted > 0 {
            self.deps.quota.increment_generated(flow.tenant_id, persisted).await?;
        }
        self.deps
            .flows
            .update_generation_times(flow.id, next, Some(now))
            .await?;
        report.next_generation_time = Some(next);

        if report.posts.is_empty() {
            report.state = RunState::Failed(FailureReason::NoResults);
            warn!(flow_id = %flow.id, "Run ended with nothing persisted");
            if let Some(chat_id) = options.notify_chat_id {
                self.notify(chat_id, &failure_message(&flow, FailureReason::NoResults, &quota))
                    .await;
            }
        } else {
            self.transition(&flow, &mut report, RunState::Done);
            if let Some(chat_id) = options.notify_chat_id {
                self.notify(chat_id, &success_message(&flow, &report)).await;
            }
        }

        self.log_event(&format!(
            "Generation finished for flow \"{}\" ({}): {} posts, {} evicted, {} failed sources in {:.1}s; next run in {}",
            flow.name,
            flow.id,
            report.posts.len(),
            report.evicted,
            report.source_failures.len(),
            started.elapsed().as_secs_f64(),
            utils::time::format_duration(flow.frequency.interval())
        ))
        .await;
        Ok(report)
    }

    async fn fetch_all(
        &self,
        flow: &Flow,
        allocation: Vec<(Source, u32)>,
        report: &mut RunReport,
    ) -> Vec<RawPost> {
        let timeout = Duration::from_secs(self.config.source_timeout_seconds);
        let reads = allocation
            .into_iter()
            .filter(|(_, share)| *share > 0)
            .map(|(source, share)| async move {
                let reader = match source {
                    Source::Channel { .. } => &self.deps.channel_reader,
                    Source::Web { .. } => &self.deps.web_reader,
                };
                let outcome = tokio::time::timeout(timeout, reader.read(flow.id, &source, share as usize)).await;
                (source, outcome)
            });

        let mut items = Vec::new();
        for (source, outcome) in join_all(reads).await {
            let reason = match outcome {
                Ok(Ok(read)) => {
                    debug!(flow_id = %flow.id, source = %source.link(), "Source returned {} items", read.len());
                    items.extend(read);
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}s", timeout.as_secs()),
            };
            warn!(flow_id = %flow.id, source = %source.link(), "Source failed: {}", reason);
            report.source_failures.push(SourceFailure {
                link: source.link().to_string(),
                reason,
            });
        }
        items
    }

    /// Newest first (undated last), without items already stored or repeated within the run.
    async fn select_candidates(&self, mut items: Vec<RawPost>) -> Result<Vec<RawPost>> {
        items.sort_by(|a, b| newest_first(a.original_date, b.original_date));

        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(items.len());
        for item in items {
            if !seen.insert(item.source_id.clone()) {
                continue;
            }
            if self.deps.dedup.exists(&item.source_id).await? {
                debug!(key = %item.source_id, "Already stored, skipping");
                continue;
            }
            candidates.push(item);
        }
        Ok(candidates)
    }

    async fn persist_all(&self, flow: &Flow, accepted: Vec<(RawPost, String)>) -> Vec<Post> {
        let concurrency = self.config.persist_concurrency.max(1);
        stream::iter(accepted)
            .map(|(raw, content)| self.persist_one(flow, raw, content))
            .buffered(concurrency)
            .filter_map(|post| async move { post })
            .collect()
            .await
    }

    async fn persist_one(&self, flow: &Flow, raw: RawPost, content: String) -> Option<Post> {
        let key = raw.source_id.clone();
        let stored = self.deps.media.store_all(raw.media).await;
        if content.is_empty() && stored.is_empty() {
            warn!(flow_id = %flow.id, source = %raw.source_url, key = %key, "Dropping item: no text and no usable media");
            return None;
        }
        let stored_paths: Vec<String> = stored
            .images
            .iter()
            .chain(stored.videos.iter())
            .map(|m| m.path_or_url.clone())
            .collect();

        let post = NewPost {
            flow_id: flow.id,
            content: with_signature(&content, flow.signature.as_deref()),
            original_content: raw.text,
            source_id: Some(key.clone()),
            source_url: Some(raw.source_url.clone()),
            original_link: raw.original_link,
            original_date: raw.original_date,
            images: stored.images,
            videos: stored.videos,
        };

        let outcome = self.deps.dedup.insert(post).await;
        match outcome {
            Ok(InsertOutcome::Inserted(post)) => return Some(post),
            Ok(InsertOutcome::Duplicate) => {
                debug!(flow_id = %flow.id, key = %key, "Lost insert race, discarding");
            }
            Err(e) => {
                error!(flow_id = %flow.id, source = %raw.source_url, key = %key, "Failed to store post: {}", e);
            }
        }
        for path in stored_paths {
            self.deps.media.remove(&path).await;
        }
        None
    }

    async fn fail(
        &self,
        flow: &Flow,
        mut report: RunReport,
        reason: FailureReason,
        quota: &TenantQuota,
        next: DateTime<Utc>,
        options: &RunOptions,
    ) -> Result<RunReport> {
        self.transition(flow, &mut report, RunState::Failed(reason));
        self.deps
            .flows
            .update_generation_times(flow.id, next, None)
            .await?;
        report.next_generation_time = Some(next);

        if let Some(chat_id) = options.notify_chat_id {
            self.notify(chat_id, &failure_message(flow, reason, quota)).await;
        }
        self.log_event(&format!(
            "Generation for flow \"{}\" ({}) failed: {:?}",
            flow.name, flow.id, reason
        ))
        .await;
        Ok(report)
    }

    fn transition(&self, flow: &Flow, report: &mut RunReport, next: RunState) {
        info!(flow_id = %flow.id, "{} -> {}", report.state, next);
        report.state = next;
    }

    async fn notify(&self, chat_id: i64, message: &str) {
        if let Err(e) = self.deps.notifier.notify_user(chat_id, message).await {
            warn!("Failed to notify chat {}: {}", chat_id, e);
        }
    }

    async fn log_event(&self, message: &str) {
        if let Err(e) = self.deps.notifier.log_event(message).await {
            warn!("Failed to send log event: {}", e);
        }
    }
}

fn newest_first(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn with_signature(content: &str, signature: Option<&str>) -> String {
    match signature.map(str::trim).filter(|s| !s.is_empty()) {
        Some(signature) if content.is_empty() => signature.to_string(),
        Some(signature) => format!("{}\n\n{}", content, signature),
        None => content.to_string(),
    }
}

fn success_message(flow: &Flow, report: &RunReport) -> String {
    let mut message = format!("Generated {} new posts for \"{}\".", report.posts.len(), flow.name);
    if report.quota_exhausted {
        message.push_str(" Your generation limit is now used up.");
    }
    message
}

fn failure_message(flow: &Flow, reason: FailureReason, quota: &TenantQuota) -> String {
    match reason {
        FailureReason::QuotaExceeded => format!(
            "Generation limit reached for \"{}\": {}/{} posts used this period.",
            flow.name,
            quota.generated_posts,
            quota.limit().unwrap_or(0)
        ),
        FailureReason::NoSources => format!("\"{}\" has no sources. Add a channel or website first.", flow.name),
        FailureReason::NoResults => format!("No new posts were found for \"{}\".", flow.name),
    }
}
