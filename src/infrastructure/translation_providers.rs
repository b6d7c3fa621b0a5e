//! Machine translation providers
//!
//! Each provider is one HTTP endpoint behind [`TranslationProvider`]. The
//! translation pipeline owns ordering, timeouts, retries and caching; a
//! provider just makes one attempt.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

use crate::infrastructure::config::{ProviderKind, TranslationConfig};
use crate::infrastructure::http_client::{HttpClientConfig, build_client, random_user_agent};

const GOOGLE_ENDPOINT: &str = "https://translate.googleapis.com/translate_a/single";
const MYMEMORY_ENDPOINT: &str = "https://api.mymemory.translated.net/get";

#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("provider returned an empty translation")]
    Empty,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Status(status.as_u16()),
            None => Self::Transport(err.to_string()),
        }
    }
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String, ProviderError>;
}

fn non_empty(text: String) -> Result<String, ProviderError> {
    if text.trim().is_empty() {
        Err(ProviderError::Empty)
    } else {
        Ok(text)
    }
}

/// Google's public web endpoint (`client=gtx`).
pub struct GoogleWebProvider {
    client: Client,
}

impl GoogleWebProvider {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Joins the sentence chunks of `[[["out","in",..],..],..]`.
    fn parse_response(body: &Value) -> Result<String, ProviderError> {
        let chunks = body
            .get(0)
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Malformed("missing sentence array".to_string()))?;
        let text: String = chunks
            .iter()
            .filter_map(|chunk| chunk.get(0).and_then(Value::as_str))
            .collect();
        non_empty(text)
    }
}

#[async_trait]
impl TranslationProvider for GoogleWebProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String, ProviderError> {
        let body: Value = self
            .client
            .get(GOOGLE_ENDPOINT)
            .query(&[("client", "gtx"), ("sl", source), ("tl", target), ("dt", "t"), ("q", text)])
            .header(reqwest::header::USER_AGENT, random_user_agent())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::parse_response(&body)
    }
}

/// MyMemory translation memory API.
pub struct MyMemoryProvider {
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MyMemoryResponse {
    response_data: MyMemoryData,
    response_status: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MyMemoryData {
    translated_text: String,
}

impl MyMemoryProvider {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn parse_response(response: MyMemoryResponse) -> Result<String, ProviderError> {
        // responseStatus arrives as either a number or a string.
        let status = match &response.response_status {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        match status {
            Some(200) => non_empty(response.response_data.translated_text),
            Some(code) => Err(ProviderError::Status(u16::try_from(code).unwrap_or(u16::MAX))),
            None => Err(ProviderError::Malformed("missing responseStatus".to_string())),
        }
    }
}

#[async_trait]
impl TranslationProvider for MyMemoryProvider {
    fn name(&self) -> &str {
        "mymemory"
    }

    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String, ProviderError> {
        let langpair = format!("{source}|{target}");
        let response: MyMemoryResponse = self
            .client
            .get(MYMEMORY_ENDPOINT)
            .query(&[("q", text), ("langpair", langpair.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Self::parse_response(response)
    }
}

/// Self-hostable LibreTranslate instance.
pub struct LibreTranslateProvider {
    client: Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibreResponse {
    translated_text: String,
}

impl LibreTranslateProvider {
    #[must_use]
    pub fn new(client: Client, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key,
        }
    }

    /// LibreTranslate only knows bare language codes (`zh`, not `zh-CN`).
    fn bare_code(lang: &str) -> &str {
        lang.split(['-', '_']).next().unwrap_or(lang)
    }
}

#[async_trait]
impl TranslationProvider for LibreTranslateProvider {
    fn name(&self) -> &str {
        "libretranslate"
    }

    async fn translate(&self, text: &str, source: &str, target: &str) -> Result<String, ProviderError> {
        let mut body = json!({
            "q": text,
            "source": Self::bare_code(source),
            "target": Self::bare_code(target),
            "format": "text",
        });
        if let Some(key) = &self.api_key {
            body["api_key"] = Value::String(key.clone());
        }

        let response: LibreResponse = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        non_empty(response.translated_text)
    }
}

/// Providers in configured fallback order.
pub fn build_providers(config: &TranslationConfig) -> Result<Vec<Arc<dyn TranslationProvider>>, ProviderError> {
    let client = build_client(&HttpClientConfig::with_timeout(config.provider_timeout_seconds))
        .map_err(|e| ProviderError::Transport(e.to_string()))?;

    Ok(config
        .providers
        .iter()
        .map(|kind| -> Arc<dyn TranslationProvider> {
            match kind {
                ProviderKind::Google => Arc::new(GoogleWebProvider::new(client.clone())),
                ProviderKind::MyMemory => Arc::new(MyMemoryProvider::new(client.clone())),
                ProviderKind::LibreTranslate => Arc::new(LibreTranslateProvider::new(
                    client.clone(),
                    config.libretranslate_url.clone(),
                    config.libretranslate_api_key.clone(),
                )),
            }
        })
        .collect())
}
