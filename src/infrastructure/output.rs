//! Run input and output collaborators
//!
//! Records go to a [`RecordSink`], terminal failures to a [`FailureLog`].
//! Both ship a JSON-lines file implementation and an in-memory one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

use crate::domain::errors::{ErrorKind, ImportError};
use crate::domain::product::ProductRecord;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One line of the failure log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub url: String,
    pub kind: ErrorKind,
    pub message: String,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

impl FailureEntry {
    #[must_use]
    pub fn new(url: impl Into<String>, error: &ImportError, attempts: u32) -> Self {
        Self {
            url: url.into(),
            kind: error.kind(),
            message: error.to_string(),
            attempts,
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn write(&self, record: &ProductRecord) -> Result<(), OutputError>;
    async fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }
}

#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn record(&self, entry: FailureEntry) -> Result<(), OutputError>;
    async fn flush(&self) -> Result<(), OutputError> {
        Ok(())
    }
}

/// Appends one JSON document per line.
pub struct JsonLinesWriter {
    path: PathBuf,
    file: AsyncMutex<File>,
}

impl JsonLinesWriter {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, OutputError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| OutputError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| OutputError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: AsyncMutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append<T: Serialize + Sync>(&self, value: &T) -> Result<(), OutputError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(|source| OutputError::Io {
            path: self.path.clone(),
            source,
        })
    }

    async fn sync(&self) -> Result<(), OutputError> {
        self.file.lock().await.flush().await.map_err(|source| OutputError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl RecordSink for JsonLinesWriter {
    async fn write(&self, record: &ProductRecord) -> Result<(), OutputError> {
        self.append(record).await
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.sync().await
    }
}

#[async_trait]
impl FailureLog for JsonLinesWriter {
    async fn record(&self, entry: FailureEntry) -> Result<(), OutputError> {
        self.append(&entry).await
    }

    async fn flush(&self) -> Result<(), OutputError> {
        self.sync().await
    }
}

#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<Vec<ProductRecord>>,
}

impl MemoryRecordSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<ProductRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn write(&self, record: &ProductRecord) -> Result<(), OutputError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFailureLog {
    entries: Mutex<Vec<FailureEntry>>,
}

impl MemoryFailureLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<FailureEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn record(&self, entry: FailureEntry) -> Result<(), OutputError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

/// Candidate URL lines: trimmed, without blanks and `#` comments.
#[must_use]
pub fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

pub async fn read_url_list(path: &Path) -> Result<Vec<String>, OutputError> {
    let content = fs::read_to_string(path).await.map_err(|source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_url_list(&content))
}

/// Example input file written when none exists.
pub const SAMPLE_URL_FILE: &str = "\
# One product URL per line. Lines starting with # are ignored.
https://detail.1688.com/offer/623456789012.html
https://item.taobao.com/item.htm?id=612345678901
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_list_skips_blanks_and_comments() {
        let urls = parse_url_list("  \n# comment\nhttps://a\n\n  https://b  \n");
        assert_eq!(urls, vec!["https://a", "https://b"]);
        assert_eq!(parse_url_list(SAMPLE_URL_FILE).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("failures.jsonl");
        let log = JsonLinesWriter::create(&path).await.unwrap();

        let err = ImportError::unsolvable("https://item.taobao.com/item.htm?id=1", "slider");
        log.record(FailureEntry::new("https://item.taobao.com/item.htm?id=1", &err, 3))
            .await
            .unwrap();
        FailureLog::flush(&log).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let entry: FailureEntry = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(entry.kind, ErrorKind::CaptchaUnsolvable);
        assert_eq!(entry.attempts, 3);
    }
}
