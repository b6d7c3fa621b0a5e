//! # Translation pipeline
//!
//! Chinese product text goes through an ordered list of
//! [`TranslationProvider`]s. The first provider that answers wins and its
//! result is cached under the blake3 hash of the source text. Concurrent
//! requests for the same text share one provider call.
//!
//! Translation never fails a product: when every provider is down the
//! original text comes back marked [`TranslationStatus::Unavailable`].

#![allow(clippy::uninlined_format_args)]

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::domain::errors::ImportError;
use crate::domain::product::{RawProduct, Variation};
use crate::infrastructure::config::TranslationConfig;
use crate::infrastructure::translation_providers::{ProviderError, TranslationProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    /// A provider answered during this call
    Translated,
    Cached,
    /// Nothing to translate (empty or no CJK characters)
    Skipped,
    /// Every provider failed; the text is the original
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub status: TranslationStatus,
}

impl Translation {
    fn skipped(text: &str) -> Self {
        Self {
            text: text.to_string(),
            status: TranslationStatus::Skipped,
        }
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.status == TranslationStatus::Unavailable
    }
}

/// One cached translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub translated: String,
    pub provider: String,
    pub cached_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
}

/// Append-only map from text hash to translation. Each key owns a
/// [`OnceCell`]; whoever initializes it does the provider work and
/// everyone else waits for that result.
#[derive(Debug, Default)]
pub struct TranslationCache {
    cells: Mutex<HashMap<String, Arc<OnceCell<CacheEntry>>>>,
}

impl TranslationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash key for `text` in one language direction.
    #[must_use]
    pub fn key(text: &str, source: &str, target: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(source.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(target.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(text.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<CacheEntry>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cells.entry(key.to_string()).or_default())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Number of filled entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, CacheEntry> {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(key, cell)| cell.get().map(|entry| (key.clone(), entry.clone())))
            .collect()
    }

    /// Adds `entries`; keys that already hold a value keep it.
    pub fn restore(&self, entries: BTreeMap<String, CacheEntry>) -> usize {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for (key, entry) in entries {
            let cell = cells.entry(key).or_default();
            if cell.set(entry).is_ok() {
                added += 1;
            }
        }
        added
    }

    pub async fn save(&self, path: &Path) -> Result<(), CacheError> {
        let to_error = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(to_error)?;
        }
        tokio::fs::write(path, json).await.map_err(to_error)?;
        info!("💾 Saved {} cached translations to {}", self.len(), path.display());
        Ok(())
    }

    /// Loads a saved snapshot; a missing file is an empty cache.
    pub async fn load(&self, path: &Path) -> Result<usize, CacheError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let entries: BTreeMap<String, CacheEntry> = serde_json::from_slice(&bytes)?;
        let added = self.restore(entries);
        info!("📚 Restored {} cached translations from {}", added, path.display());
        Ok(added)
    }
}

/// `true` for CJK ideographs, CJK punctuation and fullwidth forms.
#[must_use]
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c,
            '\u{3000}'..='\u{303F}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{F900}'..='\u{FAFF}'
            | '\u{FF00}'..='\u{FFEF}')
    })
}

#[derive(Debug, Clone)]
pub struct TranslationSettings {
    pub source_lang: String,
    pub target_lang: String,
    pub provider_timeout: Duration,
    /// Retries after the first call, per provider
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl TranslationSettings {
    #[must_use]
    pub fn from_config(config: &TranslationConfig) -> Self {
        Self {
            source_lang: config.source_lang.clone(),
            target_lang: config.target_lang.clone(),
            provider_timeout: Duration::from_secs(config.provider_timeout_seconds),
            max_retries: config.max_retries_per_provider,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Translated view of a [`RawProduct`]. `untranslated` names the fields
/// that kept some original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedProduct {
    pub title: Translation,
    pub description: Option<Translation>,
    pub short_description: Option<Translation>,
    pub category_path: Vec<String>,
    pub variations: Vec<Variation>,
    pub shipping_info: BTreeMap<String, String>,
    pub seller_info: BTreeMap<String, String>,
    pub untranslated: BTreeSet<String>,
}

pub struct TranslationPipeline {
    providers: Vec<Arc<dyn TranslationProvider>>,
    cache: Arc<TranslationCache>,
    settings: TranslationSettings,
}

impl TranslationPipeline {
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn TranslationProvider>>,
        cache: Arc<TranslationCache>,
        settings: TranslationSettings,
    ) -> Self {
        Self {
            providers,
            cache,
            settings,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<TranslationCache> {
        &self.cache
    }

    pub async fn translate(&self, text: &str) -> Translation {
        let trimmed = text.trim();
        if trimmed.is_empty() || !contains_cjk(trimmed) {
            return Translation::skipped(text);
        }

        let key = TranslationCache::key(trimmed, &self.settings.source_lang, &self.settings.target_lang);
        let cell = self.cache.cell(&key);
        if let Some(entry) = cell.get() {
            return Translation {
                text: entry.translated.clone(),
                status: TranslationStatus::Cached,
            };
        }

        let mut ran_chain = false;
        let result = cell
            .get_or_try_init(|| {
                ran_chain = true;
                self.run_chain(trimmed)
            })
            .await;
        match result {
            Ok(entry) => Translation {
                text: entry.translated.clone(),
                status: if ran_chain {
                    TranslationStatus::Translated
                } else {
                    TranslationStatus::Cached
                },
            },
            Err(e) => {
                warn!("🈚 {}", e);
                Translation {
                    text: text.to_string(),
                    status: TranslationStatus::Unavailable,
                }
            }
        }
    }

    async fn run_chain(&self, text: &str) -> Result<CacheEntry, ImportError> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match self.call_provider(provider.as_ref(), text).await {
                Ok(translated) => {
                    debug!("{} translated {} chars", provider.name(), text.chars().count());
                    return Ok(CacheEntry {
                        translated,
                        provider: provider.name().to_string(),
                        cached_at: Utc::now(),
                    });
                }
                Err(e) => {
                    debug!("Provider {} gave up: {}", provider.name(), e);
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }
        if failures.is_empty() {
            failures.push("no providers configured".to_string());
        }
        Err(ImportError::TranslationUnavailable(failures.join("; ")))
    }

    /// One provider with its timeout and retry budget.
    async fn call_provider(&self, provider: &dyn TranslationProvider, text: &str) -> Result<String, ProviderError> {
        let settings = &self.settings;
        let mut last_error = ProviderError::Empty;
        for attempt in 0..=settings.max_retries {
            if attempt > 0 {
                tokio::time::sleep(settings.retry_backoff * attempt).await;
            }
            let call = provider.translate(text, &settings.source_lang, &settings.target_lang);
            match tokio::time::timeout(settings.provider_timeout, call).await {
                Ok(Ok(translated)) if !translated.trim().is_empty() => return Ok(translated.trim().to_string()),
                Ok(Ok(_)) => last_error = ProviderError::Empty,
                Ok(Err(e)) => last_error = e,
                Err(_) => {
                    last_error = ProviderError::Transport(format!("timed out after {:?}", settings.provider_timeout));
                }
            }
        }
        Err(last_error)
    }

    async fn translate_optional(&self, text: Option<&str>) -> Option<Translation> {
        match text {
            Some(text) => Some(self.translate(text).await),
            None => None,
        }
    }

    /// Translates every string; the flag is `true` when all succeeded.
    async fn translate_all<'a>(&self, texts: impl IntoIterator<Item = &'a String>) -> (Vec<String>, bool) {
        let results = join_all(texts.into_iter().map(|text| self.translate(text))).await;
        let complete = results.iter().all(|t| !t.is_unavailable());
        (results.into_iter().map(|t| t.text).collect(), complete)
    }

    async fn translate_values(&self, map: &BTreeMap<String, String>) -> (BTreeMap<String, String>, bool) {
        let (values, complete) = self.translate_all(map.values()).await;
        (map.keys().cloned().zip(values).collect(), complete)
    }

    async fn translate_variations(&self, variations: &[Variation]) -> (Vec<Variation>, bool) {
        let distinct: BTreeSet<&String> = variations
            .iter()
            .flat_map(|v| v.attributes.iter())
            .flat_map(|(name, value)| [name, value])
            .collect();
        let (translated, complete) = self.translate_all(distinct.iter().copied()).await;
        let lookup: HashMap<&String, String> = distinct.into_iter().zip(translated).collect();
        let translate = |s: &String| lookup.get(s).cloned().unwrap_or_else(|| s.clone());

        let variations = variations
            .iter()
            .map(|v| Variation {
                attributes: v
                    .attributes
                    .iter()
                    .map(|(name, value)| (translate(name), translate(value)))
                    .collect(),
                price: v.price.clone(),
                stock: v.stock,
            })
            .collect();
        (variations, complete)
    }

    /// Translates every text field of `raw` concurrently.
    pub async fn translate_product(&self, raw: &RawProduct) -> TranslatedProduct {
        let (title, description, short_description, category, variations, shipping, seller) = tokio::join!(
            self.translate(&raw.title),
            self.translate_optional(raw.description.as_deref()),
            self.translate_optional(raw.short_description.as_deref()),
            self.translate_all(&raw.category_path),
            self.translate_variations(&raw.variations),
            self.translate_values(&raw.shipping_info),
            self.translate_values(&raw.seller_info),
        );

        let mut untranslated = BTreeSet::new();
        let mut mark = |field: &str, complete: bool| {
            if !complete {
                untranslated.insert(field.to_string());
            }
        };
        mark("title", !title.is_unavailable());
        mark("description", !description.as_ref().is_some_and(Translation::is_unavailable));
        mark(
            "short_description",
            !short_description.as_ref().is_some_and(Translation::is_unavailable),
        );
        mark("category_path", category.1);
        mark("variations", variations.1);
        mark("shipping_info", shipping.1);
        mark("seller_info", seller.1);

        TranslatedProduct {
            title,
            description,
            short_description,
            category_path: category.0,
            variations: variations.0,
            shipping_info: shipping.0,
            seller_info: seller.0,
            untranslated,
        }
    }
}
