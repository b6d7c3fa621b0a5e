//! # Shared Run State
//!
//! Run-scoped state shared by the fetch pool and the orchestrator:
//! the cancellation token, live statistics and the first run-fatal error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::domain::errors::{ErrorKind, ImportError};

/// Counters for one import run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub submitted: u64,
    pub rejected_input: u64,
    /// Render attempts, retries included
    pub renders: u64,
    pub pages_fetched: u64,
    pub requeued: u64,
    pub challenges_detected: u64,
    pub challenges_solved: u64,
    pub reauthentications: u64,
    pub records_written: u64,
    pub records_with_warnings: u64,
    pub failed: u64,
    pub failures_by_kind: HashMap<ErrorKind, u64>,
}

impl RunStats {
    pub fn record_failure(&mut self, kind: ErrorKind) {
        self.failed += 1;
        *self.failures_by_kind.entry(kind).or_default() += 1;
    }

    /// Tasks that reached a terminal outcome
    #[must_use]
    pub const fn finished(&self) -> u64 {
        self.records_written + self.failed
    }
}

/// Thread-safe shared state for one run
#[derive(Debug)]
pub struct SharedState {
    pub cancellation_token: CancellationToken,
    pub stats: RwLock<RunStats>,
    started_at: DateTime<Utc>,
    fatal: Mutex<Option<ImportError>>,
}

impl SharedState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Shares an externally owned token, e.g. one cancelled by Ctrl-C.
    #[must_use]
    pub fn with_token(cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            stats: RwLock::new(RunStats::default()),
            started_at: Utc::now(),
            fatal: Mutex::new(None),
        }
    }

    pub fn request_shutdown(&self) {
        self.cancellation_token.cancel();
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Records a run-fatal error and cancels the run. Only the first error
    /// is kept.
    pub fn abort(&self, err: ImportError) {
        let mut slot = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!("🛑 Aborting run: {}", err);
            *slot = Some(err);
        }
        drop(slot);
        self.cancellation_token.cancel();
    }

    #[must_use]
    pub fn fatal_error(&self) -> Option<ImportError> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn snapshot(&self) -> RunStats {
        self.stats.read().await.clone()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
