//! Test doubles for the import pipeline
//!
//! Scripted renderer, translation providers, image fetcher and captcha
//! solver, plus fixture pages and a fast configuration. Built for unit tests
//! and behind the `test-utils` feature for the integration suite.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

use crate::domain::marketplace::Marketplace;
use crate::infrastructure::config::{AppConfig, StrategyKind};
use crate::infrastructure::image_fetcher::{AssetStorage, AssetStorageError, FetchError, ImageFetcher};
use crate::infrastructure::renderer::{RenderError, RenderRequest, RenderResponse, RenderedPage, Renderer};
use crate::infrastructure::solving_service::{SolveRequest, SolverError, SolvingService};
use crate::infrastructure::translation_providers::{ProviderError, TranslationProvider};

pub const ALIBABA_OFFER_URL: &str = "https://detail.1688.com/offer/623456789012.html";
pub const TAOBAO_ITEM_URL: &str = "https://item.taobao.com/item.htm?id=612345678901";

/// Fixture product page for `marketplace`.
#[must_use]
pub fn product_page(marketplace: Marketplace) -> String {
    match marketplace {
        Marketplace::Alibaba1688 => include_str!("../tests/fixtures/alibaba_offer.html").to_string(),
        Marketplace::Taobao => include_str!("../tests/fixtures/taobao_item.html").to_string(),
    }
}

#[must_use]
pub const fn product_url(marketplace: Marketplace) -> &'static str {
    match marketplace {
        Marketplace::Alibaba1688 => ALIBABA_OFFER_URL,
        Marketplace::Taobao => TAOBAO_ITEM_URL,
    }
}

/// Minimal PNG-signed payload; different seeds give different content hashes.
#[must_use]
pub fn fake_image(seed: u8) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend(std::iter::repeat_n(seed, 32));
    bytes
}

/// Defaults with millisecond backoffs and everything written under `dir`.
#[must_use]
pub fn test_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.workers.concurrency = 2;
    config.workers.request_timeout_seconds = 5;
    config.rate_limit.requests_per_second = 100;
    config.rate_limit.burst = 10;
    config.retry.transport_max_retries = 2;
    config.retry.transport_backoff_ms = 5;
    config.retry.rate_limit_max_retries = 2;
    config.retry.rate_limit_base_backoff_ms = 10;
    config.retry.rate_limit_max_backoff_ms = 50;
    config.challenge.strategies = vec![StrategyKind::HomepageWarmup, StrategyKind::BackoffWait];
    config.challenge.strategy_timeout_seconds = 5;
    config.challenge.max_attempts = 1;
    config.challenge.backoff_wait_ms = 5;
    config.challenge.solving_service = None;
    config.session.cookie_dir = dir.join("cookies");
    config.translation.provider_timeout_seconds = 2;
    config.translation.retry_backoff_ms = 1;
    config.translation.cache_file = None;
    config.images.dir = dir.join("images");
    config.images.retry_backoff_ms = 1;
    config.output.records_path = dir.join("records.jsonl");
    config.output.failures_path = dir.join("failures.jsonl");
    config
}

#[derive(Debug, Clone)]
pub struct RenderCall {
    pub url: String,
    pub cookie: Option<String>,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct ScriptedPage {
    status: u16,
    content: String,
    cookies: BTreeMap<String, String>,
    retry_after: Option<Duration>,
    final_url: Option<String>,
    delay: Duration,
}

impl ScriptedPage {
    #[must_use]
    pub fn ok(content: &str) -> Self {
        Self::status(200, content)
    }

    #[must_use]
    pub fn status(status: u16, content: &str) -> Self {
        Self {
            status,
            content: content.to_string(),
            cookies: BTreeMap::new(),
            retry_after: None,
            final_url: None,
            delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Holds this answer back on top of the renderer's latency.
    #[must_use]
    pub const fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Simulates a redirect, e.g. to a login wall.
    #[must_use]
    pub fn redirected_to(mut self, url: &str) -> Self {
        self.final_url = Some(url.to_string());
        self
    }
}

#[derive(Debug, Clone)]
enum Step {
    Page(ScriptedPage),
    Fail(RenderError),
}

/// Answers renders from per-URL scripts. Each URL replays its steps in
/// order and then keeps repeating the last one; unscripted URLs get a 404.
#[derive(Default)]
pub struct ScriptedRenderer {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<RenderCall>>,
    probe_error: Option<RenderError>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn script(self, url: &str, pages: Vec<ScriptedPage>) -> Self {
        self.push_steps(url, pages.into_iter().map(Step::Page));
        self
    }

    #[must_use]
    pub fn script_error(self, url: &str, error: RenderError) -> Self {
        self.push_steps(url, std::iter::once(Step::Fail(error)));
        self
    }

    #[must_use]
    pub fn failing_probe(mut self, error: RenderError) -> Self {
        self.probe_error = Some(error);
        self
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn push_steps(&self, url: &str, steps: impl Iterator<Item = Step>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default()
            .extend(steps);
    }

    fn next_step(&self, url: &str) -> Option<Step> {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = scripts.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn calls_to(&self, url: &str) -> Vec<RenderCall> {
        self.calls().into_iter().filter(|c| c.url == url).collect()
    }

    /// Highest number of renders that were running at the same time.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderError> {
        let url = request.url.to_string();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RenderCall {
                url: url.clone(),
                cookie: request.session.cookie_header(),
                at: Instant::now(),
            });

        let step = self.next_step(&url);
        let extra = match &step {
            Some(Step::Page(page)) => page.delay,
            _ => Duration::ZERO,
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let wait = self.latency + extra;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let page = match step {
            Some(Step::Fail(error)) => return Err(error),
            Some(Step::Page(page)) => page,
            None => ScriptedPage::status(404, "not found"),
        };
        let final_url = page
            .final_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .unwrap_or_else(|| request.url.clone());

        Ok(RenderResponse {
            session: request.session.with_cookies(&page.cookies),
            page: RenderedPage {
                requested_url: request.url,
                final_url,
                status: page.status,
                content: page.content,
                retry_after: page.retry_after,
            },
        })
    }

    async fn probe(&self) -> Result<(), RenderError> {
        match &self.probe_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
enum ProviderBehaviour {
    Prefix(String),
    Fail,
    /// Fails this many calls, then prefixes
    Flaky(usize, String),
}

pub struct MockProvider {
    name: String,
    behaviour: ProviderBehaviour,
    latency: Duration,
    calls: AtomicUsize,
}

impl MockProvider {
    /// Returns `"{prefix}{text}"`.
    #[must_use]
    pub fn translating(name: &str, prefix: &str) -> Self {
        Self::with_behaviour(name, ProviderBehaviour::Prefix(prefix.to_string()))
    }

    #[must_use]
    pub fn failing(name: &str) -> Self {
        Self::with_behaviour(name, ProviderBehaviour::Fail)
    }

    #[must_use]
    pub fn flaky(name: &str, failures: usize, prefix: &str) -> Self {
        Self::with_behaviour(name, ProviderBehaviour::Flaky(failures, prefix.to_string()))
    }

    fn with_behaviour(name: &str, behaviour: ProviderBehaviour) -> Self {
        Self {
            name: name.to_string(),
            behaviour,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranslationProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, text: &str, _source: &str, _target: &str) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.behaviour {
            ProviderBehaviour::Prefix(prefix) => Ok(format!("{prefix}{text}")),
            ProviderBehaviour::Flaky(failures, prefix) if call >= *failures => Ok(format!("{prefix}{text}")),
            ProviderBehaviour::Flaky(..) | ProviderBehaviour::Fail => Err(ProviderError::Status(503)),
        }
    }
}

/// Serves image bytes per URL; unknown URLs are permanent 404s.
#[derive(Default)]
pub struct MockImageFetcher {
    images: HashMap<String, Vec<u8>>,
    failures: Mutex<HashMap<String, (usize, FetchError)>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockImageFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_image(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.images.insert(url.to_string(), bytes);
        self
    }

    /// The first `times` fetches of `url` fail with `error`.
    #[must_use]
    pub fn failing(self, url: &str, times: usize, error: FetchError) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), (times, error));
        self
    }

    #[must_use]
    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ImageFetcher for MockImageFetcher {
    async fn fetch(&self, url: &str, _referer: &str) -> Result<Vec<u8>, FetchError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default() += 1;

        {
            let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((remaining, error)) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }
        self.images
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Permanent("HTTP 404".to_string()))
    }
}

/// Keeps stored assets in memory and counts writes.
#[derive(Default)]
pub struct MemoryAssetStorage {
    assets: Mutex<HashMap<PathBuf, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryAssetStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }
}

#[async_trait]
impl AssetStorage for MemoryAssetStorage {
    fn path_for(&self, hash: &str, extension: &str) -> PathBuf {
        PathBuf::from("memory").join(format!("{hash}.{extension}"))
    }

    async fn store(&self, path: &Path, bytes: &[u8]) -> Result<(), AssetStorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.assets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }
}

pub struct MockSolver {
    token: Option<String>,
    calls: AtomicUsize,
}

impl MockSolver {
    #[must_use]
    pub fn succeeding(token: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            token: None,
            calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SolvingService for MockSolver {
    fn name(&self) -> &'static str {
        "mock-solver"
    }

    async fn solve(&self, _request: &SolveRequest) -> Result<String, SolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token
            .clone()
            .ok_or_else(|| SolverError::Rejected("ERROR_CAPTCHA_UNSOLVABLE".to_string()))
    }
}
