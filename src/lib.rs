//! Marketplace Importer
//!
//! Imports product listings from 1688.com and Taobao: session-aware page
//! fetching with challenge handling, structured extraction, Chinese to
//! English translation and content-addressed image deduplication.

pub mod crawling;
pub mod domain;
pub mod infrastructure;
pub mod services;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crawling::{Collaborators, ImportPipeline, RunSummary, SharedState};
pub use domain::{ErrorKind, ImportError, Marketplace, ProductRecord};
pub use infrastructure::{AppConfig, ConfigManager};
