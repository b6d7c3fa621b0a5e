//! Session store
//!
//! Holds at most one current [`Session`] per origin. Readers get an
//! `Arc<Session>` snapshot; `save` swaps in a new value and persists it.
//! Refresh ordering is decided by the challenge controller, the store itself
//! is last-write-wins.

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::domain::marketplace::Origin;
use crate::domain::session::Session;
use crate::infrastructure::config::SessionConfig;
use crate::infrastructure::cookie_storage::{CookieStorage, StorageError};

pub struct SessionStore {
    storage: Arc<dyn CookieStorage>,
    staleness: Duration,
    current: RwLock<HashMap<Origin, Arc<Session>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(storage: Arc<dyn CookieStorage>, staleness: Duration) -> Self {
        Self {
            storage,
            staleness,
            current: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn from_config(storage: Arc<dyn CookieStorage>, config: &SessionConfig) -> Self {
        Self::new(storage, Duration::hours(config.staleness_hours))
    }

    /// Valid, non-stale session for `origin`, if one exists in memory or in
    /// storage.
    pub async fn load(&self, origin: &Origin) -> Option<Arc<Session>> {
        let now = Utc::now();

        let cached = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(origin)
            .cloned();
        if let Some(session) = cached {
            return session.is_usable(self.staleness, now).then_some(session);
        }

        let stored = match self.storage.read(origin).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!("⚠️ Could not read stored session for {}: {}", origin, e);
                return None;
            }
        };
        if !stored.is_usable(self.staleness, now) {
            debug!("Stored session for {} is stale or invalid", origin);
            return None;
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        // A concurrent save may have landed while storage was being read.
        let session = current
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(stored))
            .clone();
        info!("🍪 Reusing stored session for {}", origin);
        Some(session)
    }

    /// Loaded session, or a fresh anonymous one for first contact.
    pub async fn current_or_anonymous(&self, origin: &Origin) -> Arc<Session> {
        match self.load(origin).await {
            Some(session) => session,
            None => Arc::new(Session::anonymous(origin.clone())),
        }
    }

    /// Replaces the current session for its origin and persists it.
    pub async fn save(&self, session: Session) -> Result<Arc<Session>, StorageError> {
        let session = Arc::new(session);
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.origin.clone(), Arc::clone(&session));

        self.storage.write(&session).await?;
        debug!("Saved session for {} ({} cookies)", session.origin, session.cookies.len());
        Ok(session)
    }

    /// Drops the current session from memory and storage.
    pub async fn invalidate(&self, origin: &Origin) -> Result<(), StorageError> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(origin);
        self.storage.remove(origin).await?;
        info!("🗑️ Invalidated session for {}", origin);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::SessionStatus;
    use crate::infrastructure::cookie_storage::MemoryCookieStorage;

    fn origin() -> Origin {
        Origin::parse("https://detail.1688.com").unwrap()
    }

    fn store(storage: Arc<MemoryCookieStorage>) -> SessionStore {
        SessionStore::new(storage, Duration::hours(24))
    }

    #[tokio::test]
    async fn test_load_returns_none_when_nothing_stored() {
        let store = store(Arc::new(MemoryCookieStorage::new()));
        assert!(store.load(&origin()).await.is_none());
        let anon = store.current_or_anonymous(&origin()).await;
        assert_eq!(anon.status, SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_saved_session_survives_a_new_store_instance() {
        let storage = Arc::new(MemoryCookieStorage::new());
        let first = store(Arc::clone(&storage));
        first.save(Session::anonymous(origin()).validated()).await.unwrap();

        let second = store(storage);
        let loaded = second.load(&origin()).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Valid);
    }

    #[tokio::test]
    async fn test_stale_session_is_not_returned() {
        let storage = Arc::new(MemoryCookieStorage::new());
        let mut session = Session::anonymous(origin()).validated();
        session.validated_at = Utc::now() - Duration::hours(48);
        storage.write(&session).await.unwrap();

        assert!(store(storage).load(&origin()).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_everywhere() {
        let storage = Arc::new(MemoryCookieStorage::new());
        let store = store(Arc::clone(&storage));
        store.save(Session::anonymous(origin()).validated()).await.unwrap();

        store.invalidate(&origin()).await.unwrap();
        assert!(store.load(&origin()).await.is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_save_replaces_without_touching_old_snapshot() {
        let store = store(Arc::new(MemoryCookieStorage::new()));
        let old = store.save(Session::anonymous(origin()).validated()).await.unwrap();

        let mut cookies = std::collections::BTreeMap::new();
        cookies.insert("t".to_string(), "2".to_string());
        store.save(old.with_cookies(&cookies).validated()).await.unwrap();

        assert!(old.cookies.is_empty());
        let current = store.load(&origin()).await.unwrap();
        assert_eq!(current.cookies.get("t").map(String::as_str), Some("2"));
    }
}
