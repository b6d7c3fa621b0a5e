//! Durable key-value storage for sessions, keyed by origin.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tokio::fs;

use crate::domain::marketplace::Origin;
use crate::domain::session::Session;

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Corrupt session document for {origin}: {message}")]
    Corrupt { origin: String, message: String },
}

impl StorageError {
    fn io(path: &Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait CookieStorage: Send + Sync {
    async fn read(&self, origin: &Origin) -> Result<Option<Session>, StorageError>;
    async fn write(&self, session: &Session) -> Result<(), StorageError>;
    async fn remove(&self, origin: &Origin) -> Result<(), StorageError>;
}

/// One JSON document per origin under a directory.
pub struct FileCookieStorage {
    dir: PathBuf,
}

impl FileCookieStorage {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, origin: &Origin) -> PathBuf {
        self.dir.join(format!("{}.json", origin.storage_key()))
    }
}

#[async_trait]
impl CookieStorage for FileCookieStorage {
    async fn read(&self, origin: &Origin) -> Result<Option<Session>, StorageError> {
        let path = self.path_for(origin);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, &e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                origin: origin.to_string(),
                message: e.to_string(),
            })
    }

    async fn write(&self, session: &Session) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, &e))?;

        let path = self.path_for(&session.origin);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(session).map_err(|e| StorageError::Corrupt {
            origin: session.origin.to_string(),
            message: e.to_string(),
        })?;

        // Readers never see a half-written document.
        fs::write(&tmp, content)
            .await
            .map_err(|e| StorageError::io(&tmp, &e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StorageError::io(&path, &e))
    }

    async fn remove(&self, origin: &Origin) -> Result<(), StorageError> {
        let path = self.path_for(origin);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&path, &e)),
        }
    }
}

/// Process-local storage, for tests and dry runs.
#[derive(Default)]
pub struct MemoryCookieStorage {
    sessions: Mutex<HashMap<Origin, Session>>,
}

impl MemoryCookieStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CookieStorage for MemoryCookieStorage {
    async fn read(&self, origin: &Origin) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned())
    }

    async fn write(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.origin.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, origin: &Origin) -> Result<(), StorageError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(origin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_file_storage_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCookieStorage::new(dir.path());
        let origin = Origin::parse("https://detail.1688.com").unwrap();

        assert!(storage.read(&origin).await.unwrap().is_none());

        let mut cookies = BTreeMap::new();
        cookies.insert("cookie2".to_string(), "xyz".to_string());
        let session = Session::anonymous(origin.clone()).with_cookies(&cookies).validated();
        storage.write(&session).await.unwrap();

        let loaded = storage.read(&origin).await.unwrap().unwrap();
        assert_eq!(loaded, session);

        storage.remove(&origin).await.unwrap();
        assert!(storage.read(&origin).await.unwrap().is_none());
        storage.remove(&origin).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_document_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileCookieStorage::new(dir.path());
        let origin = Origin::parse("https://item.taobao.com").unwrap();
        std::fs::write(dir.path().join(format!("{}.json", origin.storage_key())), "{not json").unwrap();

        let err = storage.read(&origin).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
