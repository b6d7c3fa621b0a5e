//! Retry policy
//!
//! [`RetryPolicy::decide`] is a pure function of the task's counters and the
//! response classification. Jitter is applied separately by the caller so
//! decisions stay reproducible.

use std::time::Duration;

use crate::crawling::classifier::Classification;
use crate::domain::errors::ImportError;
use crate::domain::task::FetchTask;
use crate::infrastructure::config::{AppConfig, RetryConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Hand the page to the parse stage
    Forward,
    /// Task-local retry after `delay`
    Requeue { delay: Duration },
    /// Pause the whole origin for `delay`, then retry
    Backoff { delay: Duration },
    DelegateChallenge,
    Reauthenticate,
    Fail(ImportError),
    /// Stop the run
    Abort(ImportError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub transport_max_retries: u32,
    pub transport_backoff: Duration,
    pub rate_limit_max_retries: u32,
    pub rate_limit_base_backoff: Duration,
    pub rate_limit_max_backoff: Duration,
    pub jitter_ratio: f64,
    pub max_challenge_rounds: u32,
    pub auth_failure_threshold: u32,
    pub max_auth_refreshes: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let RetryConfig {
            transport_max_retries,
            transport_backoff_ms,
            rate_limit_max_retries,
            rate_limit_base_backoff_ms,
            rate_limit_max_backoff_ms,
            jitter_ratio,
        } = config.retry.clone();
        Self {
            transport_max_retries,
            transport_backoff: Duration::from_millis(transport_backoff_ms),
            rate_limit_max_retries,
            rate_limit_base_backoff: Duration::from_millis(rate_limit_base_backoff_ms),
            rate_limit_max_backoff: Duration::from_millis(rate_limit_max_backoff_ms),
            jitter_ratio,
            max_challenge_rounds: config.challenge.max_attempts,
            auth_failure_threshold: config.session.auth_failure_threshold,
            max_auth_refreshes: config.session.max_auth_refreshes,
        }
    }

    #[must_use]
    pub fn decide(&self, task: &FetchTask, classification: &Classification) -> Decision {
        let url = task.url.as_str();
        match classification {
            Classification::Ok => Decision::Forward,

            Classification::Challenge { .. } if task.challenge_rounds >= self.max_challenge_rounds => {
                Decision::Fail(ImportError::unsolvable(
                    url,
                    format!("challenge persisted after {} solved rounds", task.challenge_rounds),
                ))
            }
            Classification::Challenge { .. } => Decision::DelegateChallenge,

            Classification::AuthRequired if task.auth_failures + 1 < self.auth_failure_threshold => {
                Decision::Requeue {
                    delay: self.transport_backoff,
                }
            }
            Classification::AuthRequired if task.auth_refreshes >= self.max_auth_refreshes => {
                Decision::Fail(ImportError::SessionExpired {
                    origin: task.origin.to_string(),
                })
            }
            Classification::AuthRequired => Decision::Reauthenticate,

            Classification::RateLimited { .. } if task.rate_limit_retries >= self.rate_limit_max_retries => {
                Decision::Fail(ImportError::RateLimitExceeded {
                    origin: task.origin.to_string(),
                    retries: task.rate_limit_retries,
                })
            }
            Classification::RateLimited {
                retry_after: Some(server),
            } if *server > self.rate_limit_max_backoff => Decision::Fail(ImportError::RateLimitExceeded {
                origin: task.origin.to_string(),
                retries: task.rate_limit_retries,
            }),
            Classification::RateLimited { retry_after } => Decision::Backoff {
                delay: self.rate_limit_delay(task.rate_limit_retries, *retry_after),
            },

            Classification::Transport { message } if task.transport_retries >= self.transport_max_retries => {
                Decision::Fail(ImportError::network(
                    url,
                    format!("{message} (gave up after {} retries)", task.transport_retries),
                ))
            }
            Classification::Transport { .. } => Decision::Requeue {
                delay: self.transport_backoff * (task.transport_retries + 1),
            },

            Classification::Rejected { status } => Decision::Fail(ImportError::network(url, format!("HTTP {status}"))),

            Classification::RendererUnavailable(message) => {
                Decision::Abort(ImportError::RendererUnavailable(message.clone()))
            }
        }
    }

    /// Exponential in the retry count, never shorter than the server's
    /// `Retry-After`. Both are capped at `rate_limit_max_backoff`.
    #[must_use]
    pub fn rate_limit_delay(&self, retries: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(retries.min(16));
        let exponential = self
            .rate_limit_base_backoff
            .saturating_mul(factor)
            .min(self.rate_limit_max_backoff);
        retry_after.map_or(exponential, |server| {
            exponential.max(server.min(self.rate_limit_max_backoff))
        })
    }

    /// `delay` stretched by a random factor in `[1, 1 + jitter_ratio)`.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        if delay.is_zero() || self.jitter_ratio <= 0.0 {
            return delay;
        }
        let stretched = delay.as_secs_f64() * (1.0 + fastrand::f64() * self.jitter_ratio);
        Duration::try_from_secs_f64(stretched).unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
