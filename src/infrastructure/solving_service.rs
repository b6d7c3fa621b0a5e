//! External captcha solving service
//!
//! Optional collaborator: given the widget's site key and the page URL it
//! returns a response token. [`AntiCaptchaService`] speaks the
//! createTask / getTaskResult JSON API.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::infrastructure::config::SolvingServiceConfig;
use crate::infrastructure::http_client::{HttpClientConfig, build_client};

const MAX_POLLS: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptchaKind {
    RecaptchaV2,
    HCaptcha,
}

#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: String,
}

#[derive(Error, Debug, Clone)]
pub enum SolverError {
    #[error("Solving service rejected the task: {0}")]
    Rejected(String),

    #[error("Solving service transport error: {0}")]
    Transport(String),

    #[error("Solving service did not finish after {0} polls")]
    NotReady(u32),
}

#[async_trait]
pub trait SolvingService: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, request: &SolveRequest) -> Result<String, SolverError>;
}

pub struct AntiCaptchaService {
    client: Client,
    endpoint: String,
    api_key: String,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskResponse {
    error_id: i64,
    error_description: Option<String>,
    task_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskResultResponse {
    error_id: i64,
    error_description: Option<String>,
    status: Option<String>,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    g_recaptcha_response: Option<String>,
    token: Option<String>,
}

impl AntiCaptchaService {
    pub fn new(config: &SolvingServiceConfig) -> Result<Self, SolverError> {
        let client = build_client(&HttpClientConfig::with_timeout(30))
            .map_err(|e| SolverError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    const fn task_type(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::RecaptchaV2 => "RecaptchaV2TaskProxyless",
            CaptchaKind::HCaptcha => "HCaptchaTaskProxyless",
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, SolverError> {
        self.client
            .post(format!("{}/{}", self.endpoint, method))
            .json(&body)
            .send()
            .await
            .map_err(|e| SolverError::Transport(e.to_string()))?
            .json::<T>()
            .await
            .map_err(|e| SolverError::Transport(e.to_string()))
    }
}

#[async_trait]
impl SolvingService for AntiCaptchaService {
    fn name(&self) -> &'static str {
        "anti-captcha"
    }

    async fn solve(&self, request: &SolveRequest) -> Result<String, SolverError> {
        let created: CreateTaskResponse = self
            .post(
                "createTask",
                json!({
                    "clientKey": self.api_key,
                    "task": {
                        "type": Self::task_type(request.kind),
                        "websiteURL": request.page_url,
                        "websiteKey": request.site_key,
                    }
                }),
            )
            .await?;

        if created.error_id != 0 {
            return Err(SolverError::Rejected(
                created.error_description.unwrap_or_else(|| format!("errorId {}", created.error_id)),
            ));
        }
        let task_id = created
            .task_id
            .ok_or_else(|| SolverError::Rejected("missing taskId".to_string()))?;
        info!("🧩 Solving task {} created for {}", task_id, request.page_url);

        for poll in 1..=MAX_POLLS {
            tokio::time::sleep(self.poll_interval).await;
            let result: TaskResultResponse = self
                .post(
                    "getTaskResult",
                    json!({ "clientKey": self.api_key, "taskId": task_id }),
                )
                .await?;

            if result.error_id != 0 {
                return Err(SolverError::Rejected(
                    result.error_description.unwrap_or_else(|| format!("errorId {}", result.error_id)),
                ));
            }
            if result.status.as_deref() == Some("ready") {
                let token = result
                    .solution
                    .and_then(|s| s.g_recaptcha_response.or(s.token))
                    .ok_or_else(|| SolverError::Rejected("ready without a token".to_string()))?;
                return Ok(token);
            }
            debug!("Solving task {} still processing (poll {})", task_id, poll);
        }

        Err(SolverError::NotReady(MAX_POLLS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_result_parsing() {
        let body = r#"{"errorId":0,"status":"ready","solution":{"gRecaptchaResponse":"03AG-token"}}"#;
        let parsed: TaskResultResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status.as_deref(), Some("ready"));
        assert_eq!(
            parsed.solution.unwrap().g_recaptcha_response.as_deref(),
            Some("03AG-token")
        );
    }

    #[test]
    fn test_task_type_mapping() {
        assert_eq!(AntiCaptchaService::task_type(CaptchaKind::HCaptcha), "HCaptchaTaskProxyless");
    }
}
