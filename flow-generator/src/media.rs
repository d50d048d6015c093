use crate::config::MediaConfig;
use crate::types::{MediaError, MediaKind, MediaRef, MediaSource, RawMedia, Result};
use crate::utils;
use futures::future::join_all;
use futures::StreamExt;
use image::ImageReader;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT};
use reqwest::Client;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "m4v"];
const DEFAULT_REFERER: &str = "https://www.google.com/";

/// Media of one post after storing, with contiguous order indices.
#[derive(Debug, Default)]
pub struct StoredMedia {
    pub images: Vec<MediaRef>,
    pub videos: Vec<MediaRef>,
    pub failed: usize,
}

impl StoredMedia {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty()
    }
}

/// Durable storage for post images and videos under `<root>/posts/`.
pub struct MediaStore {
    root: PathBuf,
    temp_dir: PathBuf,
    client: Client,
    config: MediaConfig,
}

impl MediaStore {
    pub fn new(config: MediaConfig) -> Result<Self> {
        let root = config.root.clone();
        let temp_dir = root.join("tmp");
        for dir in [
            root.join("posts").join(MediaKind::Image.dir_name()),
            root.join("posts").join(MediaKind::Video.dir_name()),
            temp_dir.clone(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_seconds))
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            root,
            temp_dir,
            client,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory for downloads; lives on the same filesystem as the store.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Absolute path of a storage-relative reference.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        self.root.join(stored)
    }

    /// Stores one item and returns its storage-relative path, or the URL itself
    /// for remote images when those are kept by reference.
    pub async fn store(&self, source: MediaSource, kind: MediaKind) -> std::result::Result<String, MediaError> {
        match source {
            MediaSource::Remote(url) => {
                if kind == MediaKind::Image && self.config.keep_remote_images {
                    return Ok(url);
                }
                let temp = self.download(&url, kind).await?;
                self.persist(&temp, kind, utils::url::path_extension(&url)).await
            }
            MediaSource::Temp(temp) => {
                let hint = extension_of(&temp);
                self.persist(&temp, kind, hint).await
            }
            MediaSource::Local(path) => {
                let hint = extension_of(&path);
                self.persist(&path, kind, hint).await
            }
        }
    }

    /// Stores every item; failures are logged and skipped.
    pub async fn store_all(&self, media: Vec<RawMedia>) -> StoredMedia {
        let outcomes = join_all(media.into_iter().map(|item| async move {
            let kind = item.kind;
            let label = item.source.describe();
            (kind, label, self.store(item.source, kind).await)
        }))
        .await;

        let mut stored = StoredMedia::default();
        for (kind, label, outcome) in outcomes {
            match outcome {
                Ok(path_or_url) => {
                    let list = match kind {
                        MediaKind::Image => &mut stored.images,
                        MediaKind::Video => &mut stored.videos,
                    };
                    list.push(MediaRef {
                        path_or_url,
                        order: list.len() as u32,
                    });
                }
                Err(e) => {
                    warn!("Dropping media {}: {}", label, e);
                    stored.failed += 1;
                }
            }
        }
        stored
    }

    /// Best-effort removal of a stored file. Remote references are ignored.
    pub async fn remove(&self, stored: &str) {
        if utils::url::is_http_url(stored) {
            return;
        }
        let relative = Path::new(stored);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            warn!("Refusing to remove media outside the store: {}", stored);
            return;
        }
        match tokio::fs::remove_file(self.root.join(relative)).await {
            Ok(()) => debug!("Removed media {}", stored),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove media {}: {}", stored, e),
        }
    }

    async fn download(&self, url: &str, kind: MediaKind) -> std::result::Result<TempPath, MediaError> {
        let failed = |reason: String| MediaError::Download {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .headers(self.headers_for(url, kind))
            .send()
            .await
            .map_err(|e| failed(if e.is_timeout() { "timeout".to_string() } else { e.to_string() }))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status.as_u16())));
        }
        let max_bytes = (self.config.max_download_mb * 1024 * 1024) as u64;
        if response.content_length().is_some_and(|len| len > max_bytes) {
            return Err(failed("file too large".to_string()));
        }

        let (file, path) = tempfile::Builder::new()
            .prefix("media-")
            .tempfile_in(&self.temp_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed(e.to_string()))?;
            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(failed("file too large".to_string()));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!("Downloaded {} bytes from {}", written, url);
        Ok(path)
    }

    async fn persist(&self, path: &Path, kind: MediaKind, hint: Option<String>) -> std::result::Result<String, MediaError> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => return Err(MediaError::FileNotFound(path.to_path_buf())),
        };
        if metadata.len() == 0 {
            return Err(MediaError::InvalidMedia {
                path: path.display().to_string(),
                reason: "empty file".to_string(),
            });
        }

        let ext = match kind {
            MediaKind::Image => validate_image(path).await?,
            MediaKind::Video => hint
                .filter(|e| VIDEO_EXTENSIONS.contains(&e.as_str()))
                .unwrap_or_else(|| "mp4".to_string()),
        };

        let relative = format!("posts/{}/{}.{}", kind.dir_name(), Uuid::new_v4(), ext);
        let dest = self.root.join(&relative);
        if let Err(e) = tokio::fs::copy(path, &dest).await {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(e.into());
        }
        Ok(relative)
    }

    fn headers_for(&self, url: &str, kind: MediaKind) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(agent) = HeaderValue::from_str(&self.config.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(match kind {
                MediaKind::Image => "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
                MediaKind::Video => "video/*,*/*;q=0.8",
            }),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let referer = referer_for(url, &self.config.referer_overrides);
        if let Ok(value) = HeaderValue::from_str(&referer) {
            headers.insert(REFERER, value);
        }
        headers
    }
}

/// `Referer` for a media URL: a configured override for its host, else Google.
pub fn referer_for(url: &str, overrides: &[(String, String)]) -> String {
    let domain = utils::url::extract_domain(url).unwrap_or_default();
    overrides
        .iter()
        .find(|(host, _)| domain == *host || domain.ends_with(&format!(".{}", host)))
        .map(|(_, referer)| referer.clone())
        .unwrap_or_else(|| DEFAULT_REFERER.to_string())
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Full decode; returns the file extension matching the detected format.
async fn validate_image(path: &Path) -> std::result::Result<String, MediaError> {
    let owned = path.to_path_buf();
    let invalid = |reason: String| MediaError::InvalidMedia {
        path: path.display().to_string(),
        reason,
    };

    let checked = tokio::task::spawn_blocking(move || -> std::result::Result<String, String> {
        let reader = ImageReader::open(&owned)
            .map_err(|e| e.to_string())?
            .with_guessed_format()
            .map_err(|e| e.to_string())?;
        let format = reader.format().ok_or_else(|| "unknown image format".to_string())?;
        reader.decode().map_err(|e| e.to_string())?;
        Ok(format
            .extensions_str()
            .first()
            .copied()
            .unwrap_or("jpg")
            .to_string())
    })
    .await
    .map_err(|e| invalid(e.to_string()))?;

    checked.map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store(dir: &Path) -> MediaStore {
        MediaStore::new(MediaConfig {
            root: dir.to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    fn temp_with(store: &MediaStore, bytes: Option<&[u8]>) -> TempPath {
        let mut file = tempfile::Builder::new()
            .suffix(".jpg")
            .tempfile_in(store.temp_dir())
            .unwrap();
        match bytes {
            Some(bytes) => file.write_all(bytes).unwrap(),
            None => {
                let img = image::RgbImage::from_pixel(4, 3, image::Rgb([200, 10, 10]));
                img.write_to(&mut file, image::ImageFormat::Png).unwrap();
            }
        }
        file.into_temp_path()
    }

    #[tokio::test]
    async fn stores_valid_image_and_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let temp = temp_with(&store, None);
        let temp_path = temp.to_path_buf();

        let stored = store.store(MediaSource::Temp(temp), MediaKind::Image).await.unwrap();
        assert!(stored.starts_with("posts/images/"));
        assert!(stored.ends_with(".png"));
        assert!(store.resolve(&stored).exists());
        assert!(!temp_path.exists());

        store.remove(&stored).await;
        assert!(!store.resolve(&stored).exists());
    }

    #[tokio::test]
    async fn rejects_corrupt_image_and_still_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let temp = temp_with(&store, Some(b"definitely not an image"));
        let temp_path = temp.to_path_buf();

        let err = store.store(MediaSource::Temp(temp), MediaKind::Image).await.unwrap_err();
        assert!(matches!(err, MediaError::InvalidMedia { .. }));
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let err = store
            .store(MediaSource::Local(dir.path().join("nope.mp4")), MediaKind::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn remote_images_are_kept_by_reference() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let url = "https://cdn.example.com/a.jpg";
        assert_eq!(store.store(MediaSource::Remote(url.into()), MediaKind::Image).await.unwrap(), url);
    }

    #[tokio::test]
    async fn store_all_keeps_order_contiguous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let media = vec![
            RawMedia { kind: MediaKind::Image, source: MediaSource::Temp(temp_with(&store, None)) },
            RawMedia { kind: MediaKind::Image, source: MediaSource::Temp(temp_with(&store, Some(b"junk"))) },
            RawMedia { kind: MediaKind::Image, source: MediaSource::Temp(temp_with(&store, None)) },
        ];
        let stored = store.store_all(media).await;
        assert_eq!(stored.failed, 1);
        assert_eq!(stored.images.iter().map(|m| m.order).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn referer_overrides_match_subdomains() {
        let overrides = MediaConfig::default().referer_overrides;
        assert_eq!(referer_for("https://photos.atptour.com/x.jpg", &overrides), "https://www.atptour.com/");
        assert_eq!(referer_for("https://example.com/x.jpg", &overrides), DEFAULT_REFERER);
    }

    #[tokio::test]
    async fn remove_refuses_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let outside = dir.path().join("keep.txt");
        std::fs::write(&outside, b"x").unwrap();
        store.remove("../keep.txt").await;
        store.remove("/etc/hostname").await;
        assert!(outside.exists());
    }
}
