mod common;

use common::*;
use flow_generator::llm_adapter::{LlmError, MockLlmAdapter};
use flow_generator::orchestrator::{FailureReason, RunOptions, RunState};
use flow_generator::traits::{FlowRepository, PostRepository, QuotaLedger};
use flow_generator::types::{Flow, GeneratorError, NewPost, PostStatus, Source};
use uuid::Uuid;

const CHANNEL_ID: i64 = 1001;

fn channel_flow(volume: u32) -> Flow {
    let mut flow = Flow::new(Uuid::new_v4(), "Morning digest", "@digest_out");
    flow.volume = volume;
    flow.sources = vec![Source::Channel {
        link: "https://t.me/news".to_string(),
    }];
    flow
}

fn notify(chat_id: i64) -> RunOptions {
    RunOptions {
        allow_partial: true,
        notify_chat_id: Some(chat_id),
    }
}

#[tokio::test]
async fn overflow_run_keeps_flow_at_volume() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(12),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(5);
    harness.store.add_flow(flow.clone()).await;

    for i in 0..4 {
        let old = NewPost {
            flow_id: flow.id,
            content: format!("old post {}", i),
            original_content: format!("old post {}", i),
            source_id: Some(format!("legacy_{}", i)),
            ..Default::default()
        }
        .into_post(hours_ago(100 - i));
        harness.store.seed_post(old).await;
    }

    let report = harness.orchestrator.generate(flow.id, notify(42)).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.posts.len(), 5);
    assert_eq!(report.evicted, 4);

    let remaining = harness.store.flow_posts(flow.id).await;
    assert_eq!(remaining.len(), 5);
    assert!(remaining
        .iter()
        .all(|p| p.source_id.as_deref().is_some_and(|k| k.starts_with("channel_1001_"))));

    let messages = harness.notifier.user_messages(42).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Generated 5 new posts"));
}

#[tokio::test]
async fn published_posts_are_evicted_on_overflow() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(12),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(5);
    harness.store.add_flow(flow.clone()).await;

    for i in 0..5 {
        let mut old = NewPost {
            flow_id: flow.id,
            content: format!("published post {}", i),
            original_content: format!("published post {}", i),
            source_id: Some(format!("legacy_{}", i)),
            ..Default::default()
        }
        .into_post(hours_ago(100 - i));
        old.status = PostStatus::Published;
        old.publication_date = Some(hours_ago(90 - i));
        harness.store.seed_post(old).await;
    }

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.posts.len(), 5);
    assert_eq!(report.evicted, 5);

    let remaining = harness.store.flow_posts(flow.id).await;
    assert_eq!(remaining.len(), 5);
    assert!(!remaining
        .iter()
        .any(|p| p.source_id.as_deref().is_some_and(|k| k.starts_with("legacy_"))));
    assert!(remaining.iter().all(|p| p.status == PostStatus::Draft));
}

#[tokio::test]
async fn repeated_run_adds_nothing_new() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(3),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(3);
    harness.store.add_flow(flow.clone()).await;

    let first = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();
    assert_eq!(first.posts.len(), 3);
    let calls_after_first = harness.llm.call_count();

    let second = harness.orchestrator.generate(flow.id, notify(7)).await.unwrap();
    assert_eq!(second.state, RunState::Failed(FailureReason::NoResults));
    assert!(second.posts.is_empty());
    assert_eq!(harness.llm.call_count(), calls_after_first);
    assert_eq!(harness.store.flow_posts(flow.id).await.len(), 3);

    let quota = harness.store.tenant_quota(flow.tenant_id).await.unwrap();
    assert_eq!(quota.generated_posts, 3);

    let stored = harness.store.flow(flow.id).await.unwrap();
    assert!(stored.next_generation_time.is_some());
    assert!(harness.notifier.user_messages(7).await[0].contains("No new posts"));
}

#[tokio::test]
async fn partial_quota_keeps_most_recent_posts() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(5),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(5);
    harness.store.add_flow(flow.clone()).await;
    harness.store.set_tenant_quota(limited_quota(flow.tenant_id, 8, 10)).await;

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert!(report.quota_exhausted);
    assert_eq!(report.posts.len(), 2);
    let mut texts: Vec<String> = report.posts.iter().map(|p| p.content.clone()).collect();
    texts.sort();
    assert_eq!(texts, vec!["News item number 4", "News item number 5"]);

    let quota = harness.store.tenant_quota(flow.tenant_id).await.unwrap();
    assert_eq!(quota.generated_posts, 10);
}

#[tokio::test]
async fn quota_overflow_without_partial_persists_nothing() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(5),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(5);
    harness.store.add_flow(flow.clone()).await;
    harness.store.set_tenant_quota(limited_quota(flow.tenant_id, 8, 10)).await;

    let report = harness
        .orchestrator
        .generate(
            flow.id,
            RunOptions {
                allow_partial: false,
                notify_chat_id: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Failed(FailureReason::QuotaExceeded));
    assert!(harness.store.flow_posts(flow.id).await.is_empty());
    let quota = harness.store.tenant_quota(flow.tenant_id).await.unwrap();
    assert_eq!(quota.generated_posts, 8);
}

#[tokio::test]
async fn exhausted_quota_fails_before_reading_sources() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(5),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(5);
    harness.store.add_flow(flow.clone()).await;
    harness.store.set_tenant_quota(limited_quota(flow.tenant_id, 10, 10)).await;

    let report = harness.orchestrator.generate(flow.id, notify(9)).await.unwrap();

    assert_eq!(report.state, RunState::Failed(FailureReason::QuotaExceeded));
    assert_eq!(harness.llm.call_count(), 0);
    assert!(report.next_generation_time.is_some());
    let stored = harness.store.flow(flow.id).await.unwrap();
    assert_eq!(stored.next_generation_time, report.next_generation_time);
    assert!(stored.last_generated_at.is_none());
    assert!(harness.notifier.user_messages(9).await[0].contains("10/10"));
}

#[tokio::test]
async fn flow_without_sources_fails() {
    let harness = Harness::new(ScriptedSession::new(CHANNEL_ID, "news"), MockLlmAdapter::new("echo"));
    let mut flow = channel_flow(5);
    flow.sources.clear();
    harness.store.add_flow(flow.clone()).await;

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();
    assert_eq!(report.state, RunState::Failed(FailureReason::NoSources));
    assert!(report.next_generation_time.is_some());
}

#[tokio::test]
async fn failed_transformation_drops_only_that_item() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(4),
        MockLlmAdapter::new("picky").with_failure_on("number 2", LlmError::BadRequest("refused".into())),
    );
    let flow = channel_flow(4);
    harness.store.add_flow(flow.clone()).await;

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.posts.len(), 3);
    assert_eq!(report.dropped_transform, 1);
    assert!(report.posts.iter().all(|p| !p.content.contains("number 2")));
    assert_eq!(harness.notifier.alerts().await.len(), 1);
}

#[tokio::test]
async fn media_failure_is_isolated_per_item() {
    let now = hours_ago(0);
    let mut with_photo = text_message(3, "Photo story", now);
    with_photo.media = photo("good");
    let mut broken_photo = text_message(2, "Story with a lost photo", hours_ago(1));
    broken_photo.media = photo("missing");
    let mut photo_only = text_message(1, "", hours_ago(2));
    photo_only.media = photo("missing");

    let session = ScriptedSession::new(CHANNEL_ID, "news")
        .push(with_photo)
        .push(broken_photo)
        .push(photo_only)
        .with_file("good", png_bytes());
    let harness = Harness::new(session, MockLlmAdapter::new("echo"));
    let flow = channel_flow(3);
    harness.store.add_flow(flow.clone()).await;

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();
    assert_eq!(report.posts.len(), 2);

    let photo_post = report.posts.iter().find(|p| p.content == "Photo story").unwrap();
    assert_eq!(photo_post.images.len(), 1);
    let stored = &photo_post.images[0].path_or_url;
    assert!(stored.starts_with("posts/images/"));
    assert!(stored.ends_with(".png"));
    assert!(harness.media.resolve(stored).exists());

    let lost = report
        .posts
        .iter()
        .find(|p| p.content == "Story with a lost photo")
        .unwrap();
    assert!(lost.images.is_empty());
}

#[tokio::test]
async fn skips_cross_promotion_and_groups_albums() {
    let mut promo = text_message(5, "Subscribe to our friends", hours_ago(0));
    promo.button_urls = vec!["https://t.me/OtherChannel".to_string()];
    let mut album_last = text_message(4, "", hours_ago(1));
    album_last.grouped_id = Some(77);
    album_last.media = photo("a2");
    let mut album_first = text_message(3, "Gallery from the match", hours_ago(1));
    album_first.grouped_id = Some(77);
    album_first.media = photo("a1");

    let session = ScriptedSession::new(CHANNEL_ID, "news")
        .push(promo)
        .push(album_last)
        .push(album_first)
        .push(text_message(2, "Second headline", hours_ago(2)))
        .push(text_message(1, "First headline", hours_ago(3)))
        .with_file("a1", png_bytes())
        .with_file("a2", png_bytes());
    let harness = Harness::new(session, MockLlmAdapter::new("echo"));
    let flow = channel_flow(5);
    harness.store.add_flow(flow.clone()).await;

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();

    let keys: Vec<String> = report.posts.iter().filter_map(|p| p.source_id.clone()).collect();
    assert_eq!(keys.len(), 3);
    assert!(keys.contains(&"channel_1001_album_77".to_string()));
    assert!(!keys.contains(&"channel_1001_5".to_string()));

    let album = report
        .posts
        .iter()
        .find(|p| p.source_id.as_deref() == Some("channel_1001_album_77"))
        .unwrap();
    assert_eq!(album.content, "Gallery from the match");
    assert_eq!(album.images.len(), 2);
    assert_eq!(album.images[0].order, 0);
    assert_eq!(album.images[1].order, 1);
}

#[tokio::test]
async fn failing_source_does_not_abort_the_run() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(4),
        MockLlmAdapter::new("echo"),
    );
    let mut flow = channel_flow(6);
    flow.signature = Some("Follow @digest_out".to_string());
    flow.sources.push(Source::Web {
        link: "https://broken.example".to_string(),
        rss_url: None,
    });
    flow.sources.push(Source::Web {
        link: "https://ok.example".to_string(),
        rss_url: None,
    });
    harness.store.add_flow(flow.clone()).await;
    harness.web.fail("https://broken.example").await;
    harness
        .web
        .set(
            "https://ok.example",
            vec![
                ("Web story one".to_string(), Some(hours_ago(30))),
                ("Web story two".to_string(), None),
            ],
        )
        .await;

    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.posts.len(), 4);
    assert_eq!(report.source_failures.len(), 1);
    assert_eq!(report.source_failures[0].link, "https://broken.example");
    assert!(report
        .posts
        .iter()
        .all(|p| p.content.ends_with("\n\nFollow @digest_out")));
}

#[tokio::test]
async fn concurrent_run_for_same_flow_is_rejected() {
    let harness = Harness::new(
        ScriptedSession::new(CHANNEL_ID, "news").with_text_messages(2),
        MockLlmAdapter::new("echo"),
    );
    let flow = channel_flow(2);
    harness.store.add_flow(flow.clone()).await;

    let held = harness.store.try_lock_flow_run(flow.id).await.unwrap();
    assert!(held.is_some());

    let outcome = harness.orchestrator.generate(flow.id, RunOptions::default()).await;
    assert!(matches!(outcome, Err(GeneratorError::RunInProgress { .. })));

    drop(held);
    let report = harness.orchestrator.generate(flow.id, RunOptions::default()).await.unwrap();
    assert_eq!(report.posts.len(), 2);
}

#[tokio::test]
async fn unknown_flow_is_reported() {
    let harness = Harness::new(ScriptedSession::new(CHANNEL_ID, "news"), MockLlmAdapter::new("echo"));
    let outcome = harness
        .orchestrator
        .generate(Uuid::new_v4(), RunOptions::default())
        .await;
    assert!(matches!(outcome, Err(GeneratorError::FlowNotFound { .. })));
}

#[tokio::test]
async fn inserted_keys_are_unique() {
    let harness = Harness::new(ScriptedSession::new(CHANNEL_ID, "news"), MockLlmAdapter::new("echo"));
    let flow = channel_flow(5);
    let post = NewPost {
        flow_id: flow.id,
        content: "once".to_string(),
        source_id: Some("rss_abc".to_string()),
        ..Default::default()
    };
    assert!(harness.store.insert_post(post.clone()).await.unwrap().is_some());
    assert!(harness.store.insert_post(post).await.unwrap().is_none());
    assert_eq!(harness.store.flow_posts(flow.id).await.len(), 1);
}
