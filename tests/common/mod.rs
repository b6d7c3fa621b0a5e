//! Shared wiring for the pipeline scenarios.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use marketplace_importer_lib::crawling::{Collaborators, ImportPipeline, RunSummary, SharedState};
use marketplace_importer_lib::domain::ImportError;
use marketplace_importer_lib::infrastructure::config::AppConfig;
use marketplace_importer_lib::infrastructure::cookie_storage::{CookieStorage, FileCookieStorage};
use marketplace_importer_lib::infrastructure::output::{MemoryFailureLog, MemoryRecordSink};
use marketplace_importer_lib::infrastructure::solving_service::SolvingService;
use marketplace_importer_lib::infrastructure::translation_providers::TranslationProvider;
use marketplace_importer_lib::services::TranslationCache;
use marketplace_importer_lib::test_utils::{
    MemoryAssetStorage, MockImageFetcher, MockProvider, ScriptedRenderer, test_config,
};

/// One wired pipeline plus handles on every double it was built with.
pub struct Scenario {
    pub config: AppConfig,
    pub renderer: Arc<ScriptedRenderer>,
    pub fetcher: Arc<MockImageFetcher>,
    pub storage: Arc<MemoryAssetStorage>,
    pub records: Arc<MemoryRecordSink>,
    pub failures: Arc<MemoryFailureLog>,
    pub cache: Arc<TranslationCache>,
    pub pipeline: ImportPipeline,
}

pub struct ScenarioBuilder {
    config: AppConfig,
    renderer: ScriptedRenderer,
    fetcher: MockImageFetcher,
    providers: Vec<Arc<dyn TranslationProvider>>,
    solver: Option<Arc<dyn SolvingService>>,
}

impl ScenarioBuilder {
    /// Cookies, images and output all live under `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            config: test_config(dir),
            renderer: ScriptedRenderer::new(),
            fetcher: MockImageFetcher::new(),
            providers: vec![Arc::new(MockProvider::translating("mock", "EN "))],
            solver: None,
        }
    }

    pub fn config(mut self, adjust: impl FnOnce(&mut AppConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    pub fn renderer(mut self, renderer: ScriptedRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn fetcher(mut self, fetcher: MockImageFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn providers(mut self, providers: Vec<Arc<dyn TranslationProvider>>) -> Self {
        self.providers = providers;
        self
    }

    pub fn solver(mut self, solver: Arc<dyn SolvingService>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn build(self) -> Scenario {
        let renderer = Arc::new(self.renderer);
        let fetcher = Arc::new(self.fetcher);
        let storage = Arc::new(MemoryAssetStorage::new());
        let records = Arc::new(MemoryRecordSink::new());
        let failures = Arc::new(MemoryFailureLog::new());
        let cache = Arc::new(TranslationCache::new());
        let cookies: Arc<dyn CookieStorage> = Arc::new(FileCookieStorage::new(&self.config.session.cookie_dir));

        let parts = Collaborators {
            renderer: renderer.clone(),
            solver: self.solver,
            cookie_storage: cookies,
            providers: self.providers,
            translation_cache: cache.clone(),
            image_fetcher: fetcher.clone(),
            asset_storage: storage.clone(),
            records: records.clone(),
            failures: failures.clone(),
        };
        let pipeline = ImportPipeline::from_config(&self.config, parts, Arc::new(SharedState::new()))
            .expect("pipeline wiring");

        Scenario {
            config: self.config,
            renderer,
            fetcher,
            storage,
            records,
            failures,
            cache,
            pipeline,
        }
    }
}

impl Scenario {
    pub async fn run(&self, urls: &[&str]) -> Result<RunSummary, ImportError> {
        self.pipeline
            .run(urls.iter().map(ToString::to_string).collect())
            .await
    }
}

/// Taobao item URL with a distinct id.
pub fn taobao_item(id: u64) -> String {
    format!("https://item.taobao.com/item.htm?id={id}")
}
