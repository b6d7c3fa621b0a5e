//! # Crawling
//!
//! Everything between a submitted URL and a fetched product page: response
//! classification, retry decisions, challenge resolution, the fetch worker
//! pool and the orchestrator that drives a whole import run.

pub mod challenge;
pub mod classifier;
pub mod orchestrator;
pub mod retry;
pub mod state;
pub mod workers;

pub use challenge::{ChallengeController, ChallengeOutcome, ChallengeReport};
pub use classifier::{ChallengeKind, Classification, ResponseClassifier};
pub use orchestrator::{Collaborators, ImportPipeline, RunSummary};
pub use retry::{Decision, RetryPolicy};
pub use state::{RunStats, SharedState};
pub use workers::{FetchOutcome, FetchWorkerPool, PoolSettings};
