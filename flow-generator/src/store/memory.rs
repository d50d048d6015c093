use crate::traits::{FlowRepository, PostFilter, PostLock, PostRepository, QuotaLedger, RunLock, StatusUpdate};
use crate::types::{Flow, GeneratorError, NewPost, Post, Result, Source, TenantQuota};
use async_trait::async_trait;
use chrono::{DateTime, Months, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    flows: RwLock<HashMap<Uuid, Flow>>,
    /// Insertion order doubles as the tie-breaker for equal `created_at`.
    posts: RwLock<Vec<Post>>,
    post_locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    tenants: RwLock<HashMap<Uuid, TenantQuota>>,
    running: Arc<StdMutex<HashSet<Uuid>>>,
}

/// In-process repository for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_flow(&self, flow: Flow) {
        self.inner.flows.write().await.insert(flow.id, flow);
    }

    pub async fn set_tenant_quota(&self, quota: TenantQuota) {
        self.inner.tenants.write().await.insert(quota.tenant_id, quota);
    }

    /// Inserts a fully formed post as-is, bypassing key checks.
    pub async fn seed_post(&self, post: Post) {
        self.inner.posts.write().await.push(post);
    }

    pub async fn flow(&self, id: Uuid) -> Option<Flow> {
        self.inner.flows.read().await.get(&id).cloned()
    }

    pub async fn flow_posts(&self, flow_id: Uuid) -> Vec<Post> {
        self.inner
            .posts
            .read()
            .await
            .iter()
            .filter(|p| p.flow_id == flow_id)
            .cloned()
            .collect()
    }

    fn post_mutex(&self, id: Uuid) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .inner
            .post_locks
            .lock()
            .map_err(|_| GeneratorError::General("post lock table poisoned".to_string()))?;
        Ok(locks.entry(id).or_default().clone())
    }

    /// Drops the publish mutexes of posts that no longer exist.
    fn forget_post_locks(&self, ids: impl IntoIterator<Item = Uuid>) {
        if let Ok(mut locks) = self.inner.post_locks.lock() {
            for id in ids {
                locks.remove(&id);
            }
        }
    }
}

struct RunGuard {
    running: Arc<StdMutex<HashSet<Uuid>>>,
    flow_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.flow_id);
        }
    }
}

#[async_trait]
impl FlowRepository for MemoryStore {
    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        Ok(self.flow(id).await)
    }

    async fn set_source_feed_url(&self, flow_id: Uuid, link: &str, rss_url: Option<&str>) -> Result<()> {
        let mut flows = self.inner.flows.write().await;
        let flow = flows
            .get_mut(&flow_id)
            .ok_or(GeneratorError::FlowNotFound { id: flow_id })?;
        for source in flow.sources.iter_mut() {
            if let Source::Web { link: l, rss_url: cached } = source {
                if l == link {
                    *cached = rss_url.map(str::to_string);
                }
            }
        }
        Ok(())
    }

    async fn update_generation_times(
        &self,
        flow_id: Uuid,
        next_generation_time: DateTime<Utc>,
        last_generated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut flows = self.inner.flows.write().await;
        let flow = flows
            .get_mut(&flow_id)
            .ok_or(GeneratorError::FlowNotFound { id: flow_id })?;
        flow.next_generation_time = Some(next_generation_time);
        if last_generated_at.is_some() {
            flow.last_generated_at = last_generated_at;
        }
        Ok(())
    }

    async fn try_lock_flow_run(&self, flow_id: Uuid) -> Result<Option<RunLock>> {
        let mut running = self
            .inner
            .running
            .lock()
            .map_err(|_| GeneratorError::General("run registry poisoned".to_string()))?;
        if !running.insert(flow_id) {
            return Ok(None);
        }
        Ok(Some(RunLock::new(RunGuard {
            running: self.inner.running.clone(),
            flow_id,
        })))
    }
}

struct MemoryPostLock {
    store: MemoryStore,
    _guard: OwnedMutexGuard<()>,
    post: Post,
}

#[async_trait]
impl PostLock for MemoryPostLock {
    fn post(&self) -> &Post {
        &self.post
    }

    async fn commit(self: Box<Self>, update: StatusUpdate) -> Result<Post> {
        let mut posts = self.store.inner.posts.write().await;
        let post = posts
            .iter_mut()
            .find(|p| p.id == self.post.id)
            .ok_or(GeneratorError::PostNotFound { id: self.post.id })?;
        post.status = update.status;
        post.publication_date = update.publication_date;
        post.scheduled_time = update.scheduled_time;
        Ok(post.clone())
    }
}

#[async_trait]
impl PostRepository for MemoryStore {
    async fn post_exists(&self, source_id: &str) -> Result<bool> {
        Ok(self
            .inner
            .posts
            .read()
            .await
            .iter()
            .any(|p| p.source_id.as_deref() == Some(source_id)))
    }

    async fn insert_post(&self, post: NewPost) -> Result<Option<Post>> {
        let mut posts = self.inner.posts.write().await;
        if let Some(key) = post.source_id.as_deref() {
            if posts.iter().any(|p| p.source_id.as_deref() == Some(key)) {
                return Ok(None);
            }
        }
        let post = post.into_post(Utc::now());
        posts.push(post.clone());
        Ok(Some(post))
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        Ok(self.inner.posts.read().await.iter().find(|p| p.id == id).cloned())
    }

    async fn list_posts(&self, filter: PostFilter) -> Result<Vec<Post>> {
        let posts = self.inner.posts.read().await;
        let mut matching: Vec<Post> = posts
            .iter()
            .filter(|p| filter.flow_id.map_or(true, |id| p.flow_id == id))
            .filter(|p| filter.status.map_or(true, |s| p.status == s))
            .filter(|p| match filter.scheduled_before {
                Some(before) => p.scheduled_time.is_some_and(|at| at <= before),
                None => true,
            })
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.created_at);
        Ok(matching)
    }

    async fn count_flow_posts(&self, flow_id: Uuid) -> Result<u64> {
        Ok(self
            .inner
            .posts
            .read()
            .await
            .iter()
            .filter(|p| p.flow_id == flow_id)
            .count() as u64)
    }

    async fn delete_oldest(&self, flow_id: Uuid, count: u64) -> Result<Vec<Post>> {
        let mut posts = self.inner.posts.write().await;
        let mut candidates: Vec<(usize, DateTime<Utc>)> = posts
            .iter()
            .enumerate()
            .filter(|(_, p)| p.flow_id == flow_id)
            .map(|(i, p)| (i, p.created_at))
            .collect();
        candidates.sort_by_key(|&(i, created_at)| (created_at, i));
        let doomed: HashSet<usize> = candidates
            .into_iter()
            .take(count as usize)
            .map(|(i, _)| i)
            .collect();

        let mut evicted = Vec::with_capacity(doomed.len());
        let mut kept = Vec::with_capacity(posts.len());
        for (i, post) in posts.drain(..).enumerate() {
            if doomed.contains(&i) {
                evicted.push(post);
            } else {
                kept.push(post);
            }
        }
        *posts = kept;
        drop(posts);
        self.forget_post_locks(evicted.iter().map(|p| p.id));
        Ok(evicted)
    }

    async fn latest_original_date(&self, prefix: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .posts
            .read()
            .await
            .iter()
            .filter(|p| p.source_id.as_deref().is_some_and(|k| k.starts_with(prefix)))
            .filter_map(|p| p.original_date)
            .max())
    }

    async fn lock_post(&self, id: Uuid) -> Result<Box<dyn PostLock>> {
        let guard = self.post_mutex(id)?.lock_owned().await;
        let Some(post) = self.get_post(id).await? else {
            drop(guard);
            self.forget_post_locks([id]);
            return Err(GeneratorError::PostNotFound { id });
        };
        Ok(Box::new(MemoryPostLock {
            store: self.clone(),
            _guard: guard,
            post,
        }))
    }

    async fn delete_post(&self, id: Uuid) -> Result<bool> {
        let mut posts = self.inner.posts.write().await;
        let before = posts.len();
        posts.retain(|p| p.id != id);
        let removed = posts.len() != before;
        drop(posts);
        if removed {
            self.forget_post_locks([id]);
        }
        Ok(removed)
    }
}

#[async_trait]
impl QuotaLedger for MemoryStore {
    async fn tenant_quota(&self, tenant_id: Uuid) -> Result<TenantQuota> {
        let now = Utc::now();
        let mut tenants = self.inner.tenants.write().await;
        let quota = tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantQuota::unlimited(tenant_id));
        if quota.needs_reset(now) {
            quota.generated_posts = 0;
            quota.reset_at = now.checked_add_months(Months::new(1));
        }
        Ok(quota.clone())
    }

    async fn increment_generated(&self, tenant_id: Uuid, count: u32) -> Result<TenantQuota> {
        let mut tenants = self.inner.tenants.write().await;
        let quota = tenants
            .entry(tenant_id)
            .or_insert_with(|| TenantQuota::unlimited(tenant_id));
        quota.generated_posts = quota.generated_posts.saturating_add(count);
        Ok(quota.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tariff;
    use chrono::Duration;
    use tokio_test::assert_ok;

    fn new_post(flow_id: Uuid, key: &str) -> NewPost {
        NewPost {
            flow_id,
            content: "c".into(),
            original_content: "o".into(),
            source_id: Some(key.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_key() {
        let store = MemoryStore::new();
        let flow_id = Uuid::new_v4();
        let first = assert_ok!(store.insert_post(new_post(flow_id, "k1")).await);
        assert!(first.is_some());
        let second = assert_ok!(store.insert_post(new_post(flow_id, "k1")).await);
        assert!(second.is_none());
        assert_eq!(store.count_flow_posts(flow_id).await.unwrap(), 1);
        assert!(store.post_exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn run_lock_is_exclusive_until_dropped() {
        let store = MemoryStore::new();
        let flow_id = Uuid::new_v4();
        let lock = store.try_lock_flow_run(flow_id).await.unwrap();
        assert!(lock.is_some());
        assert!(store.try_lock_flow_run(flow_id).await.unwrap().is_none());
        drop(lock);
        assert!(store.try_lock_flow_run(flow_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn quota_resets_after_period() {
        let store = MemoryStore::new();
        let tenant_id = Uuid::new_v4();
        store
            .set_tenant_quota(TenantQuota {
                tenant_id,
                generated_posts: 40,
                reset_at: Some(Utc::now() - Duration::days(1)),
                tariff: Some(Tariff {
                    generations_available: 50,
                    channels_available: 1,
                    sources_available: 3,
                }),
            })
            .await;
        let quota = store.tenant_quota(tenant_id).await.unwrap();
        assert_eq!(quota.generated_posts, 0);
        assert!(quota.reset_at.unwrap() > Utc::now());
        assert_eq!(quota.remaining(), Some(50));
    }

    #[tokio::test]
    async fn delete_oldest_breaks_ties_by_insertion() {
        let store = MemoryStore::new();
        let flow_id = Uuid::new_v4();
        let at = Utc::now();
        for key in ["a", "b", "c"] {
            store.seed_post(new_post(flow_id, key).into_post(at)).await;
        }
        let evicted = store.delete_oldest(flow_id, 2).await.unwrap();
        let keys: Vec<_> = evicted.iter().filter_map(|p| p.source_id.clone()).collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.count_flow_posts(flow_id).await.unwrap(), 1);
    }

    fn tracked_locks(store: &MemoryStore) -> usize {
        store.inner.post_locks.lock().unwrap().len()
    }

    #[tokio::test]
    async fn deleted_posts_release_their_publish_locks() {
        let store = MemoryStore::new();
        let flow_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for key in ["a", "b", "c"] {
            let post = assert_ok!(store.insert_post(new_post(flow_id, key)).await).unwrap();
            drop(assert_ok!(store.lock_post(post.id).await));
            ids.push(post.id);
        }
        assert_eq!(tracked_locks(&store), 3);

        store.delete_oldest(flow_id, 2).await.unwrap();
        assert_eq!(tracked_locks(&store), 1);

        assert!(store.delete_post(ids[2]).await.unwrap());
        assert_eq!(tracked_locks(&store), 0);

        assert!(matches!(
            store.lock_post(ids[0]).await,
            Err(GeneratorError::PostNotFound { .. })
        ));
        assert_eq!(tracked_locks(&store), 0);
    }
}
