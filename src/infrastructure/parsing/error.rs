//! Parsing error types
//!
//! Detailed errors for product page extraction, mapped to
//! `ImportError::ParseError` at the pipeline boundary.

use thiserror::Error;

use crate::domain::errors::ImportError;

pub type ParsingResult<T> = Result<T, ParsingError>;

#[derive(Error, Debug, Clone)]
pub enum ParsingError {
    #[error("Required field '{field}' not found")]
    RequiredFieldMissing {
        field: String,
        tried_selectors: Vec<String>,
    },

    #[error("Invalid CSS selector: {selector} - {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("No parser registered for {url}")]
    UnsupportedPage { url: String },

    #[error("Content validation failed: {reason}")]
    ContentValidationFailed { reason: String, content_length: usize },
}

impl ParsingError {
    pub fn required_field_missing(field: impl Into<String>, tried_selectors: &[String]) -> Self {
        Self::RequiredFieldMissing {
            field: field.into(),
            tried_selectors: tried_selectors.to_vec(),
        }
    }

    pub fn invalid_selector(selector: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSelector {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    /// Converts into the pipeline error for `url`.
    #[must_use]
    pub fn into_import_error(self, url: &str) -> ImportError {
        ImportError::parse(url, self.to_string())
    }
}
