//! Configuration infrastructure
//!
//! Configuration is layered:
//! 1. Built-in defaults (`defaults` constants)
//! 2. Optional JSON/TOML file
//! 3. `IMPORTER__SECTION__FIELD` environment variables
//!
//! Every section carries `#[serde(default)]` so partial files are valid.

#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub workers: WorkerConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub challenge: ChallengeConfig,
    pub session: SessionConfig,
    pub translation: TranslationConfig,
    pub images: ImageConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Fetch worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent fetch workers
    pub concurrency: usize,

    /// Bounded queue capacity between submission and workers
    pub queue_capacity: usize,

    /// Timeout for a single render call in seconds
    pub request_timeout_seconds: u64,

    /// Concurrent parse/translate/download pipelines after fetch
    pub post_process_concurrency: usize,
}

/// Per-origin token bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst: u32,
}

/// Retry budgets and backoff for the fetch pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Re-queues allowed after transport errors
    pub transport_max_retries: u32,

    /// Linear backoff step for transport errors in milliseconds
    pub transport_backoff_ms: u64,

    /// Re-queues allowed after rate-limited responses
    pub rate_limit_max_retries: u32,

    /// Base delay for the per-origin exponential backoff in milliseconds
    pub rate_limit_base_backoff_ms: u64,

    /// Cap for the per-origin exponential backoff in milliseconds
    pub rate_limit_max_backoff_ms: u64,

    /// Fraction of the delay added as random jitter (0.0 - 1.0)
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    HomepageWarmup,
    SolvingService,
    BackoffWait,
}

/// Challenge handling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Strategy order tried for each challenge
    pub strategies: Vec<StrategyKind>,

    /// Timeout for one strategy attempt in seconds
    pub strategy_timeout_seconds: u64,

    /// Rounds over the strategy list before giving up
    pub max_attempts: u32,

    /// Base wait of the backoff strategy in milliseconds
    pub backoff_wait_ms: u64,

    /// External solving service, disabled when `None`
    pub solving_service: Option<SolvingServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolvingServiceConfig {
    pub endpoint: String,
    pub api_key: String,
    pub poll_interval_ms: u64,
}

/// Session persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory holding one cookie document per origin
    pub cookie_dir: PathBuf,

    /// Sessions older than this are not reused
    pub staleness_hours: i64,

    /// Consecutive auth-required responses before a forced re-authentication
    pub auth_failure_threshold: u32,

    /// Forced re-authentications allowed per task
    pub max_auth_refreshes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Google,
    MyMemory,
    LibreTranslate,
}

/// Translation fallback chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub providers: Vec<ProviderKind>,
    pub source_lang: String,
    pub target_lang: String,
    pub provider_timeout_seconds: u64,
    pub max_retries_per_provider: u32,
    pub retry_backoff_ms: u64,
    pub libretranslate_url: String,
    pub libretranslate_api_key: Option<String>,
    /// Snapshot file for reusing translations across runs
    pub cache_file: Option<PathBuf>,
}

/// Image download and storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub dir: PathBuf,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub download_timeout_seconds: u64,
    /// Concurrent downloads per product
    pub concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON-lines file of import-ready records
    pub records_path: PathBuf,

    /// JSON-lines file of terminal failures
    pub failures_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted file logs
    pub json_format: bool,

    pub console_output: bool,

    pub file_output: bool,

    /// Directory for log files, defaults to `<data dir>/logs`
    pub log_dir: Option<PathBuf>,

    pub file_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: defaults::WORKER_CONCURRENCY,
            queue_capacity: defaults::QUEUE_CAPACITY,
            request_timeout_seconds: defaults::REQUEST_TIMEOUT_SECONDS,
            post_process_concurrency: defaults::POST_PROCESS_CONCURRENCY,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: defaults::REQUESTS_PER_SECOND,
            burst: defaults::RATE_LIMIT_BURST,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            transport_max_retries: defaults::TRANSPORT_MAX_RETRIES,
            transport_backoff_ms: defaults::TRANSPORT_BACKOFF_MS,
            rate_limit_max_retries: defaults::RATE_LIMIT_MAX_RETRIES,
            rate_limit_base_backoff_ms: defaults::RATE_LIMIT_BASE_BACKOFF_MS,
            rate_limit_max_backoff_ms: defaults::RATE_LIMIT_MAX_BACKOFF_MS,
            jitter_ratio: defaults::JITTER_RATIO,
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                StrategyKind::HomepageWarmup,
                StrategyKind::SolvingService,
                StrategyKind::BackoffWait,
            ],
            strategy_timeout_seconds: defaults::STRATEGY_TIMEOUT_SECONDS,
            max_attempts: defaults::CHALLENGE_MAX_ATTEMPTS,
            backoff_wait_ms: defaults::CHALLENGE_BACKOFF_WAIT_MS,
            solving_service: None,
        }
    }
}

impl Default for SolvingServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: defaults::SOLVING_SERVICE_ENDPOINT.to_string(),
            api_key: String::new(),
            poll_interval_ms: defaults::SOLVING_POLL_INTERVAL_MS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_dir: ConfigManager::get_app_data_dir().join("cookies"),
            staleness_hours: defaults::SESSION_STALENESS_HOURS,
            auth_failure_threshold: defaults::AUTH_FAILURE_THRESHOLD,
            max_auth_refreshes: defaults::MAX_AUTH_REFRESHES,
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderKind::Google,
                ProviderKind::MyMemory,
                ProviderKind::LibreTranslate,
            ],
            source_lang: defaults::SOURCE_LANG.to_string(),
            target_lang: defaults::TARGET_LANG.to_string(),
            provider_timeout_seconds: defaults::PROVIDER_TIMEOUT_SECONDS,
            max_retries_per_provider: defaults::PROVIDER_MAX_RETRIES,
            retry_backoff_ms: defaults::PROVIDER_RETRY_BACKOFF_MS,
            libretranslate_url: defaults::LIBRETRANSLATE_URL.to_string(),
            libretranslate_api_key: None,
            cache_file: None,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            dir: ConfigManager::get_app_data_dir().join("images"),
            max_retries: defaults::IMAGE_MAX_RETRIES,
            retry_backoff_ms: defaults::IMAGE_RETRY_BACKOFF_MS,
            download_timeout_seconds: defaults::IMAGE_DOWNLOAD_TIMEOUT_SECONDS,
            concurrency: defaults::IMAGE_CONCURRENCY,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        let out = ConfigManager::get_app_data_dir().join("output");
        Self {
            records_path: out.join("products.jsonl"),
            failures_path: out.join("failures.jsonl"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: None,
            file_name: defaults::LOG_FILE_NAME.to_string(),
        }
    }
}

impl AppConfig {
    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.concurrency == 0 {
            bail!("workers.concurrency must be at least 1");
        }
        if self.workers.queue_capacity == 0 {
            bail!("workers.queue_capacity must be at least 1");
        }
        if self.rate_limit.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be at least 1");
        }
        if self.rate_limit.burst == 0 {
            bail!("rate_limit.burst must be at least 1");
        }
        if self.challenge.strategies.is_empty() {
            bail!("challenge.strategies must name at least one strategy");
        }
        if self.challenge.max_attempts == 0 {
            bail!("challenge.max_attempts must be at least 1");
        }
        if self.translation.providers.is_empty() {
            bail!("translation.providers must name at least one provider");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            bail!("retry.jitter_ratio must be within 0.0..=1.0");
        }
        if self.session.staleness_hours <= 0 {
            bail!("session.staleness_hours must be positive");
        }
        Ok(())
    }
}

/// Loads, layers and persists [`AppConfig`].
pub struct ConfigManager {
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn get_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get user config directory")?
            .join(defaults::APP_DIR_NAME);
        Ok(config_dir)
    }

    /// Data directory for cookies, images, output and logs.
    #[must_use]
    pub fn get_app_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(defaults::APP_DIR_NAME)
    }

    /// Uses `<config dir>/marketplace-importer/config.json` when present.
    pub fn new() -> Result<Self> {
        let path = Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME);
        Ok(Self {
            config_path: path.exists().then_some(path),
        })
    }

    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    #[must_use]
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Builds the layered configuration and validates it.
    pub fn load(&self) -> Result<AppConfig> {
        let defaults = config::Config::try_from(&AppConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = &self.config_path {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
            info!("Loading configuration from: {:?}", path);
        }
        builder = builder.add_source(
            config::Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: AppConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if config.challenge.solving_service.is_none() {
            if let Ok(key) = std::env::var(defaults::SOLVER_KEY_ENV) {
                if !key.trim().is_empty() {
                    config.challenge.solving_service = Some(SolvingServiceConfig {
                        api_key: key.trim().to_string(),
                        ..SolvingServiceConfig::default()
                    });
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Writes `config` as pretty JSON to the managed path.
    pub async fn save_config(&self, config: &AppConfig) -> Result<()> {
        let path = match &self.config_path {
            Some(path) => path.clone(),
            None => Self::get_config_dir()?.join(defaults::CONFIG_FILE_NAME),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        let content =
            serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
        fs::write(&path, content)
            .await
            .context("Failed to write configuration file")?;

        info!("Saved configuration to: {:?}", path);
        Ok(())
    }

    /// Creates every directory the run writes into.
    pub async fn create_data_directories(config: &AppConfig) -> Result<()> {
        let mut directories = vec![config.session.cookie_dir.clone(), config.images.dir.clone()];
        for file in [&config.output.records_path, &config.output.failures_path] {
            if let Some(parent) = file.parent() {
                directories.push(parent.to_path_buf());
            }
        }

        for dir in directories {
            if dir.as_os_str().is_empty() {
                continue;
            }
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "marketplace-importer";
    pub const CONFIG_FILE_NAME: &str = "config.json";
    pub const ENV_PREFIX: &str = "IMPORTER";
    pub const SOLVER_KEY_ENV: &str = "ANTICAPTCHA_KEY";

    pub const WORKER_CONCURRENCY: usize = 3;
    pub const QUEUE_CAPACITY: usize = 256;
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const POST_PROCESS_CONCURRENCY: usize = 4;

    pub const REQUESTS_PER_SECOND: u32 = 1;
    pub const RATE_LIMIT_BURST: u32 = 2;

    pub const TRANSPORT_MAX_RETRIES: u32 = 3;
    pub const TRANSPORT_BACKOFF_MS: u64 = 2_000;
    pub const RATE_LIMIT_MAX_RETRIES: u32 = 5;
    pub const RATE_LIMIT_BASE_BACKOFF_MS: u64 = 5_000;
    pub const RATE_LIMIT_MAX_BACKOFF_MS: u64 = 120_000;
    pub const JITTER_RATIO: f64 = 0.2;

    pub const STRATEGY_TIMEOUT_SECONDS: u64 = 120;
    pub const CHALLENGE_MAX_ATTEMPTS: u32 = 2;
    pub const CHALLENGE_BACKOFF_WAIT_MS: u64 = 5_000;
    pub const SOLVING_SERVICE_ENDPOINT: &str = "https://api.anti-captcha.com";
    pub const SOLVING_POLL_INTERVAL_MS: u64 = 3_000;

    pub const SESSION_STALENESS_HOURS: i64 = 24;
    pub const AUTH_FAILURE_THRESHOLD: u32 = 2;
    pub const MAX_AUTH_REFRESHES: u32 = 1;

    pub const SOURCE_LANG: &str = "zh-CN";
    pub const TARGET_LANG: &str = "en";
    pub const PROVIDER_TIMEOUT_SECONDS: u64 = 15;
    pub const PROVIDER_MAX_RETRIES: u32 = 1;
    pub const PROVIDER_RETRY_BACKOFF_MS: u64 = 500;
    pub const LIBRETRANSLATE_URL: &str = "https://libretranslate.com/translate";

    pub const IMAGE_MAX_RETRIES: u32 = 2;
    pub const IMAGE_RETRY_BACKOFF_MS: u64 = 1_000;
    pub const IMAGE_DOWNLOAD_TIMEOUT_SECONDS: u64 = 15;
    pub const IMAGE_CONCURRENCY: usize = 4;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_FILE_NAME: &str = "importer.log";
}
