use crate::traits::PostRepository;
use crate::types::{NewPost, Post, Result};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Post),
    /// The natural key was already taken, possibly by a concurrent run.
    Duplicate,
}

/// Idempotent insertion keyed by `source_id`.
#[derive(Clone)]
pub struct DedupGate {
    posts: Arc<dyn PostRepository>,
}

impl DedupGate {
    pub fn new(posts: Arc<dyn PostRepository>) -> Self {
        Self { posts }
    }

    pub async fn exists(&self, source_id: &str) -> Result<bool> {
        self.posts.post_exists(source_id).await
    }

    pub async fn insert(&self, post: NewPost) -> Result<InsertOutcome> {
        let key = post.source_id.clone();
        match self.posts.insert_post(post).await? {
            Some(post) => Ok(InsertOutcome::Inserted(post)),
            None => {
                debug!("Duplicate natural key {:?}, skipping insert", key);
                Ok(InsertOutcome::Duplicate)
            }
        }
    }
}
