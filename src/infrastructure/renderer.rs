//! Rendering capability
//!
//! Fetching a product page is abstracted behind [`Renderer`]: the caller passes
//! the session it wants to use and gets back the page plus the session as the
//! site left it (new cookies merged). A headless browser can implement the
//! same trait; [`HttpRenderer`] is the plain HTTP implementation.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{COOKIE, HeaderValue, USER_AGENT};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::domain::session::Session;
use crate::infrastructure::http_client::{
    HttpClientConfig, build_client, collect_set_cookies, page_headers, random_user_agent,
    retry_after,
};

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: Url,
    pub session: Arc<Session>,
    pub referer: Option<String>,
}

impl RenderRequest {
    #[must_use]
    pub fn new(url: Url, session: Arc<Session>) -> Self {
        Self {
            url,
            session,
            referer: None,
        }
    }

    #[must_use]
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}

/// What the site answered, before any classification.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub requested_url: Url,
    /// URL after redirects; login walls show up here.
    pub final_url: Url,
    pub status: u16,
    pub content: String,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RenderResponse {
    pub page: RenderedPage,
    /// The request session with any cookies the site set.
    pub session: Session,
}

#[derive(Error, Debug, Clone)]
pub enum RenderError {
    #[error("Transport failure for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("Render of {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    /// The capability itself is gone; no further render can succeed.
    #[error("Renderer unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderError>;

    /// Pre-flight check run once before a run starts.
    async fn probe(&self) -> Result<(), RenderError> {
        Ok(())
    }
}

/// Plain HTTP renderer with browser-like headers and explicit cookies.
pub struct HttpRenderer {
    client: Client,
    timeout: Duration,
}

impl HttpRenderer {
    pub fn new(timeout_seconds: u64) -> Result<Self, RenderError> {
        let client = build_client(&HttpClientConfig::with_timeout(timeout_seconds))
            .map_err(|e| RenderError::Unavailable(format!("HTTP client construction failed: {e}")))?;
        Ok(Self {
            client,
            timeout: Duration::from_secs(timeout_seconds),
        })
    }

    fn map_error(url: &Url, timeout: Duration, err: &reqwest::Error) -> RenderError {
        if err.is_timeout() {
            RenderError::Timeout {
                url: url.to_string(),
                seconds: timeout.as_secs(),
            }
        } else {
            RenderError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderError> {
        let RenderRequest { url, session, referer } = request;

        let mut builder = self
            .client
            .get(url.clone())
            .headers(page_headers(referer.as_deref()))
            .header(USER_AGENT, random_user_agent());
        if let Some(cookie) = session.cookie_header() {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                builder = builder.header(COOKIE, value);
            }
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(&url, self.timeout, &e))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers = response.headers().clone();
        let content = response
            .text()
            .await
            .map_err(|e| Self::map_error(&url, self.timeout, &e))?;

        let set_cookies = collect_set_cookies(&headers);
        debug!(
            "Rendered {} -> {} ({} bytes, {} cookies set)",
            url,
            status,
            content.len(),
            set_cookies.len()
        );

        Ok(RenderResponse {
            page: RenderedPage {
                requested_url: url,
                final_url,
                status,
                content,
                retry_after: retry_after(&headers),
            },
            session: session.with_cookies(&set_cookies),
        })
    }
}
