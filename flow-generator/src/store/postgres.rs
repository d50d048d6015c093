use crate::traits::{FlowRepository, PostFilter, PostLock, PostRepository, QuotaLedger, RunLock, StatusUpdate};
use crate::types::{
    ContentLength, Flow, Frequency, GeneratorError, MediaKind, MediaRef, NewPost, Post, PostStatus, Result,
    Source, StyleFlags, Tariff, TenantQuota,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

const POST_COLUMNS: &str = "id, flow_id, content, original_content, status, source_id, source_url, \
     original_link, original_date, scheduled_time, publication_date, created_at";

const FLOW_COLUMNS: &str = "id, tenant_id, name, channel_id, theme, sources, content_length, use_emojis, \
     use_premium_emojis, title_highlight, cta, volume, signature, frequency, custom_prompt, \
     next_generation_time, last_generated_at";

const TENANT_COLUMNS: &str = "id, generated_posts_count, generation_reset_at, generations_available, \
     channels_available, sources_available";

/// Postgres-backed repositories.
#[derive(Clone)]
pub struct PgStore {
    db: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { db })
    }

    pub fn from_pool(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn flow_from_row(row: &PgRow) -> Result<Flow> {
    let content_length: String = row.try_get("content_length")?;
    let frequency: String = row.try_get("frequency")?;
    let Json(sources): Json<Vec<Source>> = row.try_get("sources")?;

    Ok(Flow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        channel_id: row.try_get("channel_id")?,
        theme: row.try_get("theme")?,
        sources,
        content_length: ContentLength::parse(&content_length)
            .ok_or_else(|| GeneratorError::General(format!("unknown content length {:?}", content_length)))?,
        style: StyleFlags {
            use_emojis: row.try_get("use_emojis")?,
            use_premium_emojis: row.try_get("use_premium_emojis")?,
            title_highlight: row.try_get("title_highlight")?,
            cta: row.try_get("cta")?,
        },
        volume: to_u32(row.try_get("volume")?),
        signature: row.try_get("signature")?,
        frequency: Frequency::parse(&frequency)
            .ok_or_else(|| GeneratorError::General(format!("unknown frequency {:?}", frequency)))?,
        custom_prompt: row.try_get("custom_prompt")?,
        next_generation_time: row.try_get("next_generation_time")?,
        last_generated_at: row.try_get("last_generated_at")?,
    })
}

fn post_from_row(row: &PgRow) -> Result<Post> {
    let status: String = row.try_get("status")?;
    Ok(Post {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        content: row.try_get("content")?,
        original_content: row.try_get("original_content")?,
        status: PostStatus::parse(&status)
            .ok_or_else(|| GeneratorError::General(format!("unknown post status {:?}", status)))?,
        source_id: row.try_get("source_id")?,
        source_url: row.try_get("source_url")?,
        original_link: row.try_get("original_link")?,
        original_date: row.try_get("original_date")?,
        scheduled_time: row.try_get("scheduled_time")?,
        publication_date: row.try_get("publication_date")?,
        created_at: row.try_get("created_at")?,
        images: Vec::new(),
        videos: Vec::new(),
    })
}

fn quota_from_row(row: &PgRow) -> Result<TenantQuota> {
    let generations: Option<i32> = row.try_get("generations_available")?;
    let channels: Option<i32> = row.try_get("channels_available")?;
    let sources: Option<i32> = row.try_get("sources_available")?;
    Ok(TenantQuota {
        tenant_id: row.try_get("id")?,
        generated_posts: to_u32(row.try_get("generated_posts_count")?),
        reset_at: row.try_get("generation_reset_at")?,
        tariff: generations.map(|g| Tariff {
            generations_available: to_u32(g),
            channels_available: channels.map(to_u32).unwrap_or(0),
            sources_available: sources.map(to_u32).unwrap_or(0),
        }),
    })
}

async fn attach_media<'e, E>(executor: E, posts: &mut [Post]) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    if posts.is_empty() {
        return Ok(());
    }
    let ids: Vec<Uuid> = posts.iter().map(|p| p.id).collect();
    let rows = sqlx::query(
        "SELECT post_id, kind, path_or_url, ord FROM post_media WHERE post_id = ANY($1) ORDER BY post_id, kind, ord",
    )
    .bind(&ids)
    .fetch_all(executor)
    .await?;

    let mut by_post: HashMap<Uuid, (Vec<MediaRef>, Vec<MediaRef>)> = HashMap::new();
    for row in rows {
        let post_id: Uuid = row.try_get("post_id")?;
        let kind: String = row.try_get("kind")?;
        let media = MediaRef {
            path_or_url: row.try_get("path_or_url")?,
            order: to_u32(row.try_get("ord")?),
        };
        let entry = by_post.entry(post_id).or_default();
        match kind.as_str() {
            "video" => entry.1.push(media),
            _ => entry.0.push(media),
        }
    }

    for post in posts.iter_mut() {
        if let Some((images, videos)) = by_post.remove(&post.id) {
            post.images = images;
            post.videos = videos;
        }
    }
    Ok(())
}

/// Advisory lock key for a flow: the first 8 bytes of its id.
fn advisory_key(flow_id: Uuid) -> i64 {
    let bytes = flow_id.as_bytes();
    let mut key = [0u8; 8];
    key.copy_from_slice(&bytes[..8]);
    i64::from_be_bytes(key)
}

#[async_trait]
impl FlowRepository for PgStore {
    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        let sql = format!("SELECT {} FROM flows WHERE id = $1", FLOW_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await?;
        row.as_ref().map(flow_from_row).transpose()
    }

    async fn set_source_feed_url(&self, flow_id: Uuid, link: &str, rss_url: Option<&str>) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let row = sqlx::query("SELECT sources FROM flows WHERE id = $1 FOR UPDATE")
            .bind(flow_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(GeneratorError::FlowNotFound { id: flow_id })?;
        let Json(mut sources): Json<Vec<Source>> = row.try_get("sources")?;

        for source in sources.iter_mut() {
            if let Source::Web { link: l, rss_url: cached } = source {
                if l == link {
                    *cached = rss_url.map(str::to_string);
                }
            }
        }

        sqlx::query("UPDATE flows SET sources = $2 WHERE id = $1")
            .bind(flow_id)
            .bind(Json(&sources))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("Cached feed url {:?} for {} on flow {}", rss_url, link, flow_id);
        Ok(())
    }

    async fn update_generation_times(
        &self,
        flow_id: Uuid,
        next_generation_time: DateTime<Utc>,
        last_generated_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE flows
            SET next_generation_time = $2,
                last_generated_at = COALESCE($3, last_generated_at)
            WHERE id = $1
            "#,
        )
        .bind(flow_id)
        .bind(next_generation_time)
        .bind(last_generated_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(GeneratorError::FlowNotFound { id: flow_id });
        }
        Ok(())
    }

    async fn try_lock_flow_run(&self, flow_id: Uuid) -> Result<Option<RunLock>> {
        let mut tx = self.db.begin().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(advisory_key(flow_id))
            .fetch_one(&mut *tx)
            .await?;
        if !acquired {
            tx.rollback().await?;
            return Ok(None);
        }
        // The lock lives as long as the transaction.
        Ok(Some(RunLock::new(tx)))
    }
}

struct PgPostLock {
    tx: Transaction<'static, Postgres>,
    post: Post,
}

#[async_trait]
impl PostLock for PgPostLock {
    fn post(&self) -> &Post {
        &self.post
    }

    async fn commit(self: Box<Self>, update: StatusUpdate) -> Result<Post> {
        let PgPostLock { mut tx, mut post } = *self;
        sqlx::query(
            "UPDATE posts SET status = $2, publication_date = $3, scheduled_time = $4 WHERE id = $1",
        )
        .bind(post.id)
        .bind(update.status.as_str())
        .bind(update.publication_date)
        .bind(update.scheduled_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        post.status = update.status;
        post.publication_date = update.publication_date;
        post.scheduled_time = update.scheduled_time;
        Ok(post)
    }
}

#[async_trait]
impl PostRepository for PgStore {
    async fn post_exists(&self, source_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM posts WHERE source_id = $1)")
            .bind(source_id)
            .fetch_one(&self.db)
            .await?;
        Ok(exists)
    }

    async fn insert_post(&self, new_post: NewPost) -> Result<Option<Post>> {
        let post = new_post.into_post(Utc::now());
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO posts (id, flow_id, content, original_content, status, source_id, source_url,
                               original_link, original_date, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_id) DO NOTHING
            "#,
        )
        .bind(post.id)
        .bind(post.flow_id)
        .bind(&post.content)
        .bind(&post.original_content)
        .bind(post.status.as_str())
        .bind(&post.source_id)
        .bind(&post.source_url)
        .bind(&post.original_link)
        .bind(post.original_date)
        .bind(post.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let media = post
            .images
            .iter()
            .map(|m| (MediaKind::Image, m))
            .chain(post.videos.iter().map(|m| (MediaKind::Video, m)));
        for (kind, item) in media {
            sqlx::query("INSERT INTO post_media (post_id, kind, path_or_url, ord) VALUES ($1, $2, $3, $4)")
                .bind(post.id)
                .bind(match kind {
                    MediaKind::Image => "image",
                    MediaKind::Video => "video",
                })
                .bind(&item.path_or_url)
                .bind(item.order as i32)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(Some(post))
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        let sql = format!("SELECT {} FROM posts WHERE id = $1", POST_COLUMNS);
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&self.db).await? else {
            return Ok(None);
        };
        let mut posts = vec![post_from_row(&row)?];
        attach_media(&self.db, &mut posts).await?;
        Ok(posts.pop())
    }

    async fn list_posts(&self, filter: PostFilter) -> Result<Vec<Post>> {
        let sql = format!(
            r#"
            SELECT {} FROM posts
            WHERE ($1::uuid IS NULL OR flow_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR scheduled_time <= $3)
            ORDER BY created_at, seq
            "#,
            POST_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(filter.flow_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.scheduled_before)
            .fetch_all(&self.db)
            .await?;
        let mut posts = rows.iter().map(post_from_row).collect::<Result<Vec<_>>>()?;
        attach_media(&self.db, &mut posts).await?;
        Ok(posts)
    }

    async fn count_flow_posts(&self, flow_id: Uuid) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE flow_id = $1")
            .bind(flow_id)
            .fetch_one(&self.db)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_oldest(&self, flow_id: Uuid, count: u64) -> Result<Vec<Post>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.db.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM posts WHERE flow_id = $1 ORDER BY created_at ASC, seq ASC LIMIT $2 FOR UPDATE",
        )
        .bind(flow_id)
        .bind(count as i64)
        .fetch_all(&mut *tx)
        .await?;

        let sql = format!("SELECT {} FROM posts WHERE id = ANY($1) ORDER BY created_at, seq", POST_COLUMNS);
        let rows = sqlx::query(&sql).bind(&ids).fetch_all(&mut *tx).await?;
        let mut evicted = rows.iter().map(post_from_row).collect::<Result<Vec<_>>>()?;
        attach_media(&mut *tx, &mut evicted).await?;

        sqlx::query("DELETE FROM posts WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(evicted)
    }

    async fn latest_original_date(&self, prefix: &str) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(original_date) FROM posts WHERE left(source_id, length($1)) = $1",
        )
        .bind(prefix)
        .fetch_one(&self.db)
        .await?;
        Ok(latest)
    }

    async fn lock_post(&self, id: Uuid) -> Result<Box<dyn PostLock>> {
        let mut tx = self.db.begin().await?;
        let sql = format!("SELECT {} FROM posts WHERE id = $1 FOR UPDATE", POST_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(GeneratorError::PostNotFound { id })?;
        let mut posts = vec![post_from_row(&row)?];
        attach_media(&mut *tx, &mut posts).await?;
        let post = posts.pop().ok_or(GeneratorError::PostNotFound { id })?;
        Ok(Box::new(PgPostLock { tx, post }))
    }

    async fn delete_post(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl QuotaLedger for PgStore {
    async fn tenant_quota(&self, tenant_id: Uuid) -> Result<TenantQuota> {
        sqlx::query(
            r#"
            UPDATE tenants
            SET generated_posts_count = 0,
                generation_reset_at = now() + interval '1 month'
            WHERE id = $1 AND (generation_reset_at IS NULL OR generation_reset_at <= now())
            "#,
        )
        .bind(tenant_id)
        .execute(&self.db)
        .await?;

        let sql = format!("SELECT {} FROM tenants WHERE id = $1", TENANT_COLUMNS);
        match sqlx::query(&sql).bind(tenant_id).fetch_optional(&self.db).await? {
            Some(row) => quota_from_row(&row),
            None => Ok(TenantQuota::unlimited(tenant_id)),
        }
    }

    async fn increment_generated(&self, tenant_id: Uuid, count: u32) -> Result<TenantQuota> {
        let sql = format!(
            "UPDATE tenants SET generated_posts_count = generated_posts_count + $2 WHERE id = $1 RETURNING {}",
            TENANT_COLUMNS
        );
        match sqlx::query(&sql)
            .bind(tenant_id)
            .bind(count as i32)
            .fetch_optional(&self.db)
            .await?
        {
            Some(row) => quota_from_row(&row),
            None => Ok(TenantQuota::unlimited(tenant_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_stable_per_flow() {
        let id = Uuid::new_v4();
        assert_eq!(advisory_key(id), advisory_key(id));
        assert_ne!(advisory_key(id), advisory_key(Uuid::new_v4()));
    }
}
