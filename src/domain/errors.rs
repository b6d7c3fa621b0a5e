//! Import error taxonomy
//!
//! Every failure a task can end with maps onto one [`ErrorKind`]. The kind
//! decides how the pipeline reacts: transient kinds are retried inside the
//! fetch pool, terminal kinds end only their own task, non-fatal kinds degrade
//! a record, and a fatal kind aborts the whole run.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type ImportResult<T> = Result<T, ImportError>;

/// Serializable error tag written to the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkError,
    RateLimitExceeded,
    CaptchaUnsolvable,
    SessionExpired,
    ParseError,
    TranslationUnavailable,
    DownloadError,
    Cancelled,
    InvalidInput,
    RendererUnavailable,
    /// The record or failure sink refused a write
    OutputError,
}

impl ErrorKind {
    /// Kinds that the fetch pool re-queues before giving up.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::NetworkError | Self::RateLimitExceeded | Self::SessionExpired
        )
    }

    /// Kinds that degrade a record instead of failing its task.
    #[must_use]
    pub const fn is_non_fatal(self) -> bool {
        matches!(self, Self::TranslationUnavailable | Self::DownloadError)
    }

    /// Kinds that abort the whole run.
    #[must_use]
    pub const fn is_run_fatal(self) -> bool {
        matches!(self, Self::RendererUnavailable)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "network_error",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::CaptchaUnsolvable => "captcha_unsolvable",
            Self::SessionExpired => "session_expired",
            Self::ParseError => "parse_error",
            Self::TranslationUnavailable => "translation_unavailable",
            Self::DownloadError => "download_error",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
            Self::RendererUnavailable => "renderer_unavailable",
            Self::OutputError => "output_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by pipeline components at their boundaries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    #[error("Network error for {url}: {message}")]
    NetworkError { url: String, message: String },

    #[error("Rate limit retries exhausted for {origin} after {retries} attempts")]
    RateLimitExceeded { origin: String, retries: u32 },

    #[error("Challenge could not be solved for {url}: {reason}")]
    CaptchaUnsolvable { url: String, reason: String },

    #[error("Session expired for {origin}")]
    SessionExpired { origin: String },

    #[error("Parse error for {url}: {message}")]
    ParseError { url: String, message: String },

    #[error("No translation provider succeeded: {0}")]
    TranslationUnavailable(String),

    #[error("Image download failed for {url}: {message}")]
    DownloadError { url: String, message: String },

    #[error("Task was cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rendering capability unavailable: {0}")]
    RendererUnavailable(String),

    #[error("Could not write output: {0}")]
    Output(String),
}

impl ImportError {
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkError {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn parse(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseError {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn download(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DownloadError {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn unsolvable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CaptchaUnsolvable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkError { .. } => ErrorKind::NetworkError,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::CaptchaUnsolvable { .. } => ErrorKind::CaptchaUnsolvable,
            Self::SessionExpired { .. } => ErrorKind::SessionExpired,
            Self::ParseError { .. } => ErrorKind::ParseError,
            Self::TranslationUnavailable(_) => ErrorKind::TranslationUnavailable,
            Self::DownloadError { .. } => ErrorKind::DownloadError,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::RendererUnavailable(_) => ErrorKind::RendererUnavailable,
            Self::Output(_) => ErrorKind::OutputError,
        }
    }

    #[must_use]
    pub const fn is_run_fatal(&self) -> bool {
        self.kind().is_run_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classes_are_disjoint() {
        let all = [
            ErrorKind::NetworkError,
            ErrorKind::RateLimitExceeded,
            ErrorKind::CaptchaUnsolvable,
            ErrorKind::SessionExpired,
            ErrorKind::ParseError,
            ErrorKind::TranslationUnavailable,
            ErrorKind::DownloadError,
            ErrorKind::Cancelled,
            ErrorKind::InvalidInput,
            ErrorKind::RendererUnavailable,
            ErrorKind::OutputError,
        ];
        for kind in all {
            let classes = [kind.is_transient(), kind.is_non_fatal(), kind.is_run_fatal()];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "{kind}");
        }
    }

    #[test]
    fn test_kind_serializes_as_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CaptchaUnsolvable).unwrap();
        assert_eq!(json, "\"captcha_unsolvable\"");
        assert_eq!(ErrorKind::CaptchaUnsolvable.to_string(), "captcha_unsolvable");
    }

    #[test]
    fn test_error_maps_to_kind() {
        let err = ImportError::parse("https://detail.1688.com/offer/1.html", "no title");
        assert_eq!(err.kind(), ErrorKind::ParseError);
        assert!(!err.is_run_fatal());
        assert!(ImportError::RendererUnavailable("gone".into()).is_run_fatal());
    }
}
