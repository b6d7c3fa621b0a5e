//! Image download and content-addressed storage

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::USER_AGENT;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::infrastructure::http_client::{HttpClientConfig, build_client, image_headers, random_user_agent};

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Worth retrying: connection reset, timeout, 5xx, 429.
    #[error("transient download failure: {0}")]
    Transient(String),

    /// Retrying will not help: 404, non-image body.
    #[error("permanent download failure: {0}")]
    Permanent(String),
}

impl FetchError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Decoded body bytes of `url`.
    async fn fetch(&self, url: &str, referer: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    pub fn new(timeout_seconds: u64) -> Result<Self, FetchError> {
        let client = build_client(&HttpClientConfig::with_timeout(timeout_seconds))
            .map_err(|e| FetchError::Permanent(format!("HTTP client construction failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, referer: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .headers(image_headers(referer))
            .header(USER_AGENT, random_user_agent())
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(FetchError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {status}")));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        if bytes.is_empty() {
            return Err(FetchError::Permanent("empty body".to_string()));
        }
        debug!("Downloaded {} ({} bytes)", url, bytes.len());
        Ok(bytes.to_vec())
    }
}

/// File extension from magic bytes, falling back to the URL path.
#[must_use]
pub fn detect_extension(bytes: &[u8], url: &str) -> &'static str {
    match bytes {
        [0xFF, 0xD8, 0xFF, ..] => return "jpg",
        [0x89, b'P', b'N', b'G', ..] => return "png",
        [b'G', b'I', b'F', b'8', ..] => return "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => return "webp",
        _ => {}
    }

    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    ["jpg", "jpeg", "png", "gif", "webp"]
        .into_iter()
        .find(|ext| path.ends_with(&format!(".{ext}")))
        .map_or("jpg", |ext| if ext == "jpeg" { "jpg" } else { ext })
}

#[derive(Error, Debug, Clone)]
#[error("failed to store asset at {path}: {message}")]
pub struct AssetStorageError {
    pub path: String,
    pub message: String,
}

#[async_trait]
pub trait AssetStorage: Send + Sync {
    /// Canonical location for content with `hash`.
    fn path_for(&self, hash: &str, extension: &str) -> PathBuf;

    async fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), AssetStorageError>;
}

/// Stores assets as `<dir>/<hash>.<ext>`.
pub struct FsAssetStorage {
    dir: PathBuf,
}

impl FsAssetStorage {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AssetStorage for FsAssetStorage {
    fn path_for(&self, hash: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{hash}.{extension}"))
    }

    async fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), AssetStorageError> {
        let to_error = |e: std::io::Error| AssetStorageError {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(to_error)?;
        }
        fs::write(path, bytes).await.map_err(to_error)
    }
}
