//! # Fetch Task Definitions
//!
//! A [`FetchTask`] follows one product URL through the fetch pool.
//! Its state only moves forward: once `Completed` or `Failed` it can never
//! be picked up again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::domain::errors::ErrorKind;
use crate::domain::marketplace::{Marketplace, Origin};

/// Unique identifier for fetch tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn inner(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Completed,
    Failed(ErrorKind),
}

impl TaskState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal task transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTask {
    pub id: TaskId,
    pub url: Url,
    pub marketplace: Marketplace,
    pub origin: Origin,
    /// Render attempts started for this task.
    pub attempts: u32,
    pub transport_retries: u32,
    pub rate_limit_retries: u32,
    pub challenge_rounds: u32,
    pub auth_failures: u32,
    pub auth_refreshes: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    state: TaskState,
}

impl FetchTask {
    #[must_use]
    pub fn new(url: Url, marketplace: Marketplace) -> Self {
        let origin = Origin::of(&url);
        Self {
            id: TaskId::new(),
            url,
            marketplace,
            origin,
            attempts: 0,
            transport_retries: 0,
            rate_limit_retries: 0,
            challenge_rounds: 0,
            auth_failures: 0,
            auth_refreshes: 0,
            last_error: None,
            created_at: Utc::now(),
            state: TaskState::Pending,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TaskState {
        self.state
    }

    /// Pending -> InFlight; counts the attempt.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::InFlight)?;
        self.attempts += 1;
        Ok(())
    }

    /// InFlight -> Pending for a scheduled retry.
    pub fn requeue(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskState::Pending)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransitionError> {
        self.transition(TaskState::Completed)
    }

    pub fn fail(&mut self, kind: ErrorKind, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(TaskState::Failed(kind))?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    fn transition(&mut self, to: TaskState) -> Result<(), TransitionError> {
        let from = self.state;
        let allowed = match (from, to) {
            (TaskState::Pending, TaskState::InFlight) => true,
            // Queued tasks that never ran can still be failed (cancellation).
            (TaskState::Pending, TaskState::Failed(_)) => true,
            (TaskState::InFlight, TaskState::Pending | TaskState::Completed | TaskState::Failed(_)) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError { from, to });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> FetchTask {
        let url = Url::parse("https://detail.1688.com/offer/1.html").unwrap();
        FetchTask::new(url, Marketplace::Alibaba1688)
    }

    #[test]
    fn test_task_survives_json_snapshot() {
        let mut task = task();
        task.start().unwrap();

        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"url\":\"https://detail.1688.com/offer/1.html\""));
        let restored: FetchTask = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.url, task.url);
        assert_eq!(restored.origin, task.origin);
        assert_eq!(restored.attempts, 1);
        assert_eq!(restored.id, task.id);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = task();
        task.start().unwrap();
        task.requeue("transport").unwrap();
        task.start().unwrap();
        task.complete().unwrap();
        assert_eq!(task.attempts, 2);
        assert!(task.state().is_terminal());
    }

    #[test]
    fn test_terminal_task_never_returns_to_pending() {
        let mut task = task();
        task.start().unwrap();
        task.fail(ErrorKind::CaptchaUnsolvable, "unsolved").unwrap();

        assert!(task.requeue("again").is_err());
        assert!(task.start().is_err());
        assert!(task.complete().is_err());
        assert_eq!(task.state(), TaskState::Failed(ErrorKind::CaptchaUnsolvable));
    }

    #[test]
    fn test_pending_cannot_complete_without_running() {
        let mut task = task();
        assert!(task.complete().is_err());
        assert!(task.fail(ErrorKind::Cancelled, "shutdown").is_ok());
    }
}
