use crate::media::MediaStore;
use crate::traits::PostRepository;
use crate::types::{Flow, Result};
use std::sync::Arc;
use tracing::info;

/// Keeps a flow at or below its configured volume by dropping its oldest posts.
pub struct FlowVolumeEvictor {
    posts: Arc<dyn PostRepository>,
    media: Arc<MediaStore>,
}

impl FlowVolumeEvictor {
    pub fn new(posts: Arc<dyn PostRepository>, media: Arc<MediaStore>) -> Self {
        Self { posts, media }
    }

    /// Returns the number of posts deleted.
    pub async fn evict(&self, flow: &Flow) -> Result<usize> {
        let count = self.posts.count_flow_posts(flow.id).await?;
        let volume = u64::from(flow.volume);
        if count <= volume {
            return Ok(0);
        }

        let evicted = self.posts.delete_oldest(flow.id, count - volume).await?;
        for post in &evicted {
            for media in post.images.iter().chain(post.videos.iter()) {
                if !media.is_remote() {
                    self.media.remove(&media.path_or_url).await;
                }
            }
        }

        info!("Evicted {} posts from flow {} (volume {})", evicted.len(), flow.id, flow.volume);
        Ok(evicted.len())
    }
}
