//! Authenticated session state for one origin.
//!
//! Sessions are values: a refresh produces a new [`Session`] which the
//! session store swaps in atomically. Holders of an older `Arc<Session>`
//! keep a consistent snapshot.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::marketplace::Origin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Valid,
    Expired,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub origin: Origin,
    /// Opaque credential material, usually cookie name to value.
    pub cookies: BTreeMap<String, String>,
    pub validated_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    /// First-contact session with no credentials.
    #[must_use]
    pub fn anonymous(origin: Origin) -> Self {
        Self {
            origin,
            cookies: BTreeMap::new(),
            validated_at: Utc::now(),
            status: SessionStatus::Unknown,
        }
    }

    /// Returns a copy carrying `updates` on top of the current cookies.
    #[must_use]
    pub fn with_cookies(&self, updates: &BTreeMap<String, String>) -> Self {
        let mut cookies = self.cookies.clone();
        cookies.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            origin: self.origin.clone(),
            cookies,
            validated_at: self.validated_at,
            status: self.status,
        }
    }

    /// Marks the session as freshly validated now.
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.status = SessionStatus::Valid;
        self.validated_at = Utc::now();
        self
    }

    #[must_use]
    pub fn is_stale(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.validated_at) > max_age
    }

    #[must_use]
    pub fn is_usable(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Valid && !self.is_stale(max_age, now)
    }

    /// `Cookie` header value, `None` when there are no cookies.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Origin {
        Origin::parse("https://detail.1688.com").unwrap()
    }

    #[test]
    fn test_with_cookies_does_not_mutate_original() {
        let session = Session::anonymous(origin());
        let mut updates = BTreeMap::new();
        updates.insert("cna".to_string(), "abc".to_string());

        let refreshed = session.with_cookies(&updates);
        assert!(session.cookies.is_empty());
        assert_eq!(refreshed.cookies.get("cna").map(String::as_str), Some("abc"));
        assert_eq!(refreshed.cookie_header().as_deref(), Some("cna=abc"));
    }

    #[test]
    fn test_staleness() {
        let mut session = Session::anonymous(origin()).validated();
        let now = Utc::now();
        assert!(session.is_usable(Duration::hours(1), now));

        session.validated_at = now - Duration::hours(2);
        assert!(session.is_stale(Duration::hours(1), now));
        assert!(!session.is_usable(Duration::hours(1), now));
    }
}
