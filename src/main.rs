//! Marketplace Importer command line entry point
//!
//! Usage: `marketplace-importer [URL_FILE]` (defaults to `urls.txt`).

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use marketplace_importer_lib::crawling::{Collaborators, ImportPipeline, SharedState};
use marketplace_importer_lib::infrastructure::config::ConfigManager;
use marketplace_importer_lib::infrastructure::cookie_storage::FileCookieStorage;
use marketplace_importer_lib::infrastructure::image_fetcher::{FsAssetStorage, HttpImageFetcher};
use marketplace_importer_lib::infrastructure::logging::{init_logging_with_config, log_system_info};
use marketplace_importer_lib::infrastructure::output::{JsonLinesWriter, SAMPLE_URL_FILE, read_url_list};
use marketplace_importer_lib::infrastructure::renderer::HttpRenderer;
use marketplace_importer_lib::infrastructure::solving_service::{AntiCaptchaService, SolvingService};
use marketplace_importer_lib::infrastructure::translation_providers::build_providers;
use marketplace_importer_lib::services::TranslationCache;

const DEFAULT_URL_FILE: &str = "urls.txt";

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigManager::new()?.load()?;
    init_logging_with_config(&config.logging)?;
    log_system_info();
    ConfigManager::create_data_directories(&config).await?;

    let url_file = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_URL_FILE), PathBuf::from);
    if !url_file.exists() {
        tokio::fs::write(&url_file, SAMPLE_URL_FILE)
            .await
            .with_context(|| format!("Failed to write sample URL file {}", url_file.display()))?;
        warn!("📝 {} did not exist; wrote a sample. Edit it and run again.", url_file.display());
        return Ok(());
    }
    let urls = read_url_list(&url_file)
        .await
        .with_context(|| format!("Failed to read {}", url_file.display()))?;

    let solver: Option<Arc<dyn SolvingService>> = match &config.challenge.solving_service {
        Some(solver_config) => Some(Arc::new(
            AntiCaptchaService::new(solver_config).context("Failed to build solving service client")?,
        )),
        None => {
            info!("No solving service configured; captcha challenges fall back to other strategies");
            None
        }
    };

    let translation_cache = Arc::new(TranslationCache::new());
    if let Some(path) = &config.translation.cache_file {
        match translation_cache.load(path).await {
            Ok(loaded) => info!("🗂️ Loaded {} cached translations", loaded),
            Err(e) => warn!("Ignoring translation cache: {}", e),
        }
    }

    let parts = Collaborators {
        renderer: Arc::new(
            HttpRenderer::new(config.workers.request_timeout_seconds).context("Failed to build renderer")?,
        ),
        solver,
        cookie_storage: Arc::new(FileCookieStorage::new(&config.session.cookie_dir)),
        providers: build_providers(&config.translation).context("Failed to build translation providers")?,
        translation_cache: Arc::clone(&translation_cache),
        image_fetcher: Arc::new(
            HttpImageFetcher::new(config.images.download_timeout_seconds).context("Failed to build image fetcher")?,
        ),
        asset_storage: Arc::new(FsAssetStorage::new(&config.images.dir)),
        records: Arc::new(JsonLinesWriter::create(&config.output.records_path).await?),
        failures: Arc::new(JsonLinesWriter::create(&config.output.failures_path).await?),
    };

    let state = Arc::new(SharedState::new());
    let pipeline = ImportPipeline::from_config(&config, parts, Arc::clone(&state))?;

    let shutdown = Arc::clone(&state);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received, cancelling the run");
            shutdown.request_shutdown();
        }
    });

    let result = pipeline.run(urls).await;

    if let Some(path) = &config.translation.cache_file {
        if let Err(e) = translation_cache.save(path).await {
            error!("Could not persist translation cache: {}", e);
        }
    }

    let summary = result.context("Import run aborted")?;
    summary.log();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    info!(
        "Records: {}  Failures: {}",
        config.output.records_path.display(),
        config.output.failures_path.display()
    );
    Ok(())
}
