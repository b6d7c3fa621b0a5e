//! Infrastructure layer: configuration, logging, HTTP plumbing, parsing and
//! the adapters behind every external collaborator (renderer, cookie store,
//! captcha solver, translation providers, image fetcher, output files).

pub mod config;
pub mod cookie_storage;
pub mod http_client;
pub mod image_fetcher;
pub mod logging;
pub mod output;
pub mod parsing;
pub mod rate_limiter;
pub mod renderer;
pub mod session_store;
pub mod solving_service;
pub mod translation_providers;

pub use config::{AppConfig, ConfigManager};
pub use cookie_storage::{CookieStorage, FileCookieStorage, MemoryCookieStorage, StorageError};
pub use image_fetcher::{AssetStorage, FetchError, FsAssetStorage, HttpImageFetcher, ImageFetcher};
pub use logging::{get_log_directory, init_logging, init_logging_with_config, log_system_info};
pub use output::{FailureEntry, FailureLog, JsonLinesWriter, RecordSink};
pub use parsing::{ParseContext, ParserRegistry, ParsingError, ParsingResult};
pub use rate_limiter::{OriginBackoff, OriginGate, OriginRateLimiter};
pub use renderer::{HttpRenderer, RenderError, RenderRequest, RenderedPage, Renderer};
pub use session_store::SessionStore;
pub use solving_service::{AntiCaptchaService, SolvingService};
pub use translation_providers::{TranslationProvider, build_providers};
