//! # Import Orchestrator
//!
//! [`ImportPipeline`] runs one import: it probes the renderer, feeds the URL
//! list into the [`FetchWorkerPool`] and post-processes fetched pages as they
//! arrive (parse, then translation and image deduplication side by side,
//! then assembly). Each URL ends up either as one record in the
//! [`RecordSink`] or as one entry in the [`FailureLog`].

#![allow(clippy::uninlined_format_args)]

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::crawling::challenge::ChallengeController;
use crate::crawling::state::{RunStats, SharedState};
use crate::crawling::workers::{FetchOutcome, FetchWorkerPool};
use crate::domain::errors::ImportError;
use crate::domain::product::RawProduct;
use crate::domain::task::FetchTask;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::cookie_storage::CookieStorage;
use crate::infrastructure::image_fetcher::{AssetStorage, ImageFetcher};
use crate::infrastructure::output::{FailureEntry, FailureLog, RecordSink};
use crate::infrastructure::parsing::{ParseContext, ParserRegistry};
use crate::infrastructure::rate_limiter::OriginGate;
use crate::infrastructure::renderer::{RenderedPage, Renderer};
use crate::infrastructure::session_store::SessionStore;
use crate::infrastructure::solving_service::SolvingService;
use crate::infrastructure::translation_providers::TranslationProvider;
use crate::services::image_dedup::{DownloadSettings, ImageDeduplicator};
use crate::services::record_assembler::RecordAssembler;
use crate::services::translation::{TranslationCache, TranslationPipeline, TranslationSettings};

/// External collaborators a run is wired with.
pub struct Collaborators {
    pub renderer: Arc<dyn Renderer>,
    pub solver: Option<Arc<dyn SolvingService>>,
    pub cookie_storage: Arc<dyn CookieStorage>,
    pub providers: Vec<Arc<dyn TranslationProvider>>,
    pub translation_cache: Arc<TranslationCache>,
    pub image_fetcher: Arc<dyn ImageFetcher>,
    pub asset_storage: Arc<dyn AssetStorage>,
    pub records: Arc<dyn RecordSink>,
    pub failures: Arc<dyn FailureLog>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stats: RunStats,
    pub unique_images: usize,
    pub cached_translations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn log(&self) {
        let elapsed = self.finished_at.signed_duration_since(self.started_at);
        info!(
            "📊 Run finished in {}s: {} records ({} with warnings), {} failed, {} renders, {} challenges solved of {}",
            elapsed.num_seconds(),
            self.stats.records_written,
            self.stats.records_with_warnings,
            self.stats.failed,
            self.stats.renders,
            self.stats.challenges_solved,
            self.stats.challenges_detected
        );
        for (kind, count) in &self.stats.failures_by_kind {
            info!("   {}: {}", kind, count);
        }
        info!(
            "   {} unique images, {} cached translations",
            self.unique_images, self.cached_translations
        );
    }
}

pub struct ImportPipeline {
    renderer: Arc<dyn Renderer>,
    pool: FetchWorkerPool,
    parsers: ParserRegistry,
    translator: TranslationPipeline,
    images: ImageDeduplicator,
    assembler: RecordAssembler,
    records: Arc<dyn RecordSink>,
    failures: Arc<dyn FailureLog>,
    state: Arc<SharedState>,
    post_process_concurrency: usize,
}

impl ImportPipeline {
    pub fn from_config(config: &AppConfig, parts: Collaborators, state: Arc<SharedState>) -> anyhow::Result<Self> {
        let Collaborators {
            renderer,
            solver,
            cookie_storage,
            providers,
            translation_cache,
            image_fetcher,
            asset_storage,
            records,
            failures,
        } = parts;

        let sessions = Arc::new(SessionStore::from_config(cookie_storage, &config.session));
        let gate = Arc::new(OriginGate::from_config(&config.rate_limit));
        let challenges = Arc::new(ChallengeController::from_config(
            &config.challenge,
            gate,
            Arc::clone(&renderer),
            Arc::clone(&sessions),
            solver,
        ));
        debug!("Challenge strategies: {:?}", challenges.strategy_order());
        let pool = FetchWorkerPool::from_config(config, Arc::clone(&renderer), sessions, challenges, Arc::clone(&state));

        Ok(Self {
            renderer,
            pool,
            parsers: ParserRegistry::new()?,
            translator: TranslationPipeline::new(
                providers,
                translation_cache,
                TranslationSettings::from_config(&config.translation),
            ),
            images: ImageDeduplicator::new(
                image_fetcher,
                asset_storage,
                DownloadSettings::from_config(&config.images),
            ),
            assembler: RecordAssembler::new(),
            records,
            failures,
            state,
            post_process_concurrency: config.workers.post_process_concurrency.max(1),
        })
    }

    #[must_use]
    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    #[must_use]
    pub fn images(&self) -> &ImageDeduplicator {
        &self.images
    }

    /// Imports `urls`. A pipeline runs once; only a run-fatal error
    /// (renderer gone) makes this return `Err`.
    pub async fn run(&self, urls: Vec<String>) -> Result<RunSummary, ImportError> {
        let started_at = Utc::now();
        info!("🚀 Importing {} URL(s) with the {} renderer", urls.len(), self.renderer.name());

        if let Err(e) = self.renderer.probe().await {
            let err = ImportError::RendererUnavailable(e.to_string());
            self.state.abort(err.clone());
            return Err(err);
        }

        let (pool_handle, outcomes) = self.pool.start();
        let consume = ReceiverStream::new(outcomes)
            .for_each_concurrent(self.post_process_concurrency, |outcome| self.handle_outcome(outcome));
        tokio::join!(self.submit_all(urls), consume);
        if let Err(e) = pool_handle.await {
            error!("Fetch pool supervisor failed: {}", e);
        }

        if let Err(e) = self.records.flush().await {
            error!("Could not flush records: {}", e);
        }
        if let Err(e) = self.failures.flush().await {
            error!("Could not flush failure log: {}", e);
        }

        if let Some(fatal) = self.state.fatal_error() {
            return Err(fatal);
        }
        self.images.log_summary();
        let summary = RunSummary {
            stats: self.state.snapshot().await,
            unique_images: self.images.assets().len(),
            cached_translations: self.translator.cache().len(),
            started_at,
            finished_at: Utc::now(),
        };
        Ok(summary)
    }

    async fn submit_all(&self, urls: Vec<String>) {
        let mut cancelled = false;
        for raw in urls {
            if !cancelled && self.state.is_shutdown_requested() {
                cancelled = true;
            }
            if cancelled {
                self.record_failure(&raw, &ImportError::Cancelled, 0).await;
                continue;
            }
            match self.pool.submit(&raw).await {
                Ok(_) => {}
                Err(ImportError::Cancelled) => {
                    cancelled = true;
                    self.record_failure(&raw, &ImportError::Cancelled, 0).await;
                }
                Err(e) => {
                    warn!("Skipping input line: {}", e);
                    self.state.stats.write().await.rejected_input += 1;
                    self.record_failure(raw.trim(), &e, 0).await;
                }
            }
        }
        self.pool.close();
        debug!("Submission finished");
    }

    async fn handle_outcome(&self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Failed { task, error } => {
                self.record_failure(task.url.as_str(), &error, task.attempts).await;
            }
            FetchOutcome::Fetched { task, page } => match self.parse(&task, &page) {
                Ok(raw) => self.process_product(raw, task.attempts).await,
                Err(error) => {
                    warn!("🧩 {}", error);
                    self.record_failure(task.url.as_str(), &error, task.attempts).await;
                }
            },
        }
    }

    fn parse(&self, task: &FetchTask, page: &RenderedPage) -> Result<RawProduct, ImportError> {
        let ctx = ParseContext::new(task.url.clone(), task.marketplace);
        self.parsers.parse_page(&page.content, &ctx)
    }

    async fn process_product(&self, raw: RawProduct, attempts: u32) {
        let referer = raw.marketplace.image_referer();
        let (translated, images) = tokio::join!(
            self.translator.translate_product(&raw),
            self.images.acquire_all(&raw.url, &raw.image_urls, referer),
        );
        let record = self.assembler.assemble(raw, translated, images);

        match self.records.write(&record).await {
            Ok(()) => {
                let mut stats = self.state.stats.write().await;
                stats.records_written += 1;
                if record.has_warnings() {
                    stats.records_with_warnings += 1;
                }
                drop(stats);
                info!(
                    "✅ {} '{}' ({} images, {} warnings)",
                    record.identifier,
                    record.name,
                    record.images.len(),
                    record.warnings.len()
                );
            }
            Err(e) => {
                error!("Could not write record for {}: {}", record.source_url, e);
                let error = ImportError::Output(e.to_string());
                self.record_failure(&record.source_url, &error, attempts).await;
            }
        }
    }

    async fn record_failure(&self, url: &str, error: &ImportError, attempts: u32) {
        self.state.stats.write().await.record_failure(error.kind());
        if let Err(e) = self.failures.record(FailureEntry::new(url, error, attempts)).await {
            error!("Could not write failure entry for {}: {}", url, e);
        }
    }
}
