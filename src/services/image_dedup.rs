//! # Image deduplication
//!
//! Every product image is downloaded, hashed with blake3 and stored once per
//! distinct content under `<image_dir>/<hash>.<ext>`. Later occurrences of
//! the same bytes only add a `(product URL, position)` reference.

#![allow(clippy::uninlined_format_args)]

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::domain::errors::ImportError;
use crate::infrastructure::config::ImageConfig;
use crate::infrastructure::image_fetcher::{AssetStorage, AssetStorageError, FetchError, ImageFetcher, detect_extension};

/// One image slot on one product page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOccurrence {
    pub product_url: String,
    pub position: usize,
    pub source_url: String,
    pub referer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AssetReference {
    pub product_url: String,
    pub position: usize,
}

/// A stored image and everything that points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageAsset {
    pub content_hash: String,
    pub path: PathBuf,
    pub references: BTreeSet<AssetReference>,
}

#[derive(Debug)]
pub struct ImageOutcome {
    pub position: usize,
    pub source_url: String,
    pub result: Result<ImageAsset, ImportError>,
}

#[derive(Debug, Default)]
struct AssetSlot {
    stored: OnceCell<PathBuf>,
    references: Mutex<BTreeSet<AssetReference>>,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadSettings {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub concurrency: usize,
}

impl DownloadSettings {
    #[must_use]
    pub fn from_config(config: &ImageConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            concurrency: config.concurrency.max(1),
        }
    }
}

pub struct ImageDeduplicator {
    fetcher: Arc<dyn ImageFetcher>,
    storage: Arc<dyn AssetStorage>,
    settings: DownloadSettings,
    slots: Mutex<HashMap<String, Arc<AssetSlot>>>,
}

impl ImageDeduplicator {
    #[must_use]
    pub fn new(fetcher: Arc<dyn ImageFetcher>, storage: Arc<dyn AssetStorage>, settings: DownloadSettings) -> Self {
        Self {
            fetcher,
            storage,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, hash: &str) -> Arc<AssetSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(hash.to_string()).or_default())
    }

    /// Downloads, hashes and stores (once per hash) the occurrence's image
    /// and records the reference. Re-acquiring the same occurrence is a
    /// no-op for the reference set.
    pub async fn acquire(&self, occurrence: ImageOccurrence) -> Result<ImageAsset, ImportError> {
        let bytes = self.download(&occurrence.source_url, &occurrence.referer).await?;
        let content_hash = blake3::hash(&bytes).to_hex().to_string();
        let slot = self.slot(&content_hash);

        let path = slot
            .stored
            .get_or_try_init(|| async {
                let path = self
                    .storage
                    .path_for(&content_hash, detect_extension(&bytes, &occurrence.source_url));
                self.storage.store(&path, &bytes).await?;
                debug!("🖼️ Stored {} ({} bytes)", path.display(), bytes.len());
                Ok::<_, AssetStorageError>(path)
            })
            .await
            .map_err(|e| ImportError::download(&occurrence.source_url, e.to_string()))?
            .clone();

        let references = {
            let mut references = slot.references.lock().unwrap_or_else(PoisonError::into_inner);
            references.insert(AssetReference {
                product_url: occurrence.product_url,
                position: occurrence.position,
            });
            references.clone()
        };

        Ok(ImageAsset {
            content_hash,
            path,
            references,
        })
    }

    /// Acquires all images of one product, at most `concurrency` at a time,
    /// in page order.
    pub async fn acquire_all(&self, product_url: &str, image_urls: &[String], referer: &str) -> Vec<ImageOutcome> {
        let outcomes: Vec<ImageOutcome> = stream::iter(image_urls.iter().enumerate())
            .map(|(position, source_url)| async move {
                let occurrence = ImageOccurrence {
                    product_url: product_url.to_string(),
                    position,
                    source_url: source_url.clone(),
                    referer: referer.to_string(),
                };
                ImageOutcome {
                    position,
                    source_url: source_url.clone(),
                    result: self.acquire(occurrence).await,
                }
            })
            .buffered(self.settings.concurrency)
            .collect()
            .await;

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        if failed > 0 {
            warn!("⚠️ {} of {} images failed for {}", failed, outcomes.len(), product_url);
        }
        outcomes
    }

    async fn download(&self, url: &str, referer: &str) -> Result<Vec<u8>, ImportError> {
        let mut attempt = 0;
        loop {
            match self.fetcher.fetch(url, referer).await {
                Ok(bytes) if bytes.is_empty() => return Err(ImportError::download(url, "empty body")),
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::Transient(message)) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    debug!("Retrying image {} ({}/{}): {}", url, attempt, self.settings.max_retries, message);
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                Err(e) => return Err(ImportError::download(url, e.to_string())),
            }
        }
    }

    #[must_use]
    pub fn asset(&self, content_hash: &str) -> Option<ImageAsset> {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(content_hash)
            .cloned()?;
        let path = slot.stored.get()?.clone();
        let references = slot.references.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(ImageAsset {
            content_hash: content_hash.to_string(),
            path,
            references,
        })
    }

    /// Stored assets, sorted by hash.
    #[must_use]
    pub fn assets(&self) -> Vec<ImageAsset> {
        let mut hashes: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        hashes.sort();
        hashes.iter().filter_map(|hash| self.asset(hash)).collect()
    }

    pub fn log_summary(&self) {
        let assets = self.assets();
        let references: usize = assets.iter().map(|a| a.references.len()).sum();
        info!("🖼️ {} unique images for {} references", assets.len(), references);
    }
}
