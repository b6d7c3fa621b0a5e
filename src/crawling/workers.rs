//! # Fetch Worker Pool
//!
//! A fixed number of workers drain a bounded intake queue of [`FetchTask`]s.
//! Each attempt passes the origin's [`OriginGate`] (backoff window, then a
//! rate permit), renders with the origin's current session and lets
//! [`RetryPolicy::decide`] pick what happens next. Retries go through a
//! separate unbounded queue so a full intake never blocks a requeue. The
//! gate is the one the [`ChallengeController`] renders through.
//!
//! Every submitted task produces exactly one [`FetchOutcome`].

#![allow(clippy::uninlined_format_args)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::crawling::challenge::{Challenge, ChallengeController};
use crate::crawling::classifier::{Classification, ResponseClassifier};
use crate::crawling::retry::{Decision, RetryPolicy};
use crate::crawling::state::SharedState;
use crate::domain::errors::ImportError;
use crate::domain::marketplace::{Marketplace, Origin};
use crate::domain::session::{Session, SessionStatus};
use crate::domain::task::{FetchTask, TaskId};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::rate_limiter::OriginGate;
use crate::infrastructure::renderer::{RenderError, RenderRequest, RenderedPage, Renderer};
use crate::infrastructure::session_store::SessionStore;

/// Terminal result of one task.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched { task: FetchTask, page: RenderedPage },
    Failed { task: FetchTask, error: ImportError },
}

impl FetchOutcome {
    #[must_use]
    pub const fn task(&self) -> &FetchTask {
        match self {
            Self::Fetched { task, .. } | Self::Failed { task, .. } => task,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
}

impl PoolSettings {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.workers.concurrency.max(1),
            queue_capacity: config.workers.queue_capacity.max(1),
            request_timeout: Duration::from_secs(config.workers.request_timeout_seconds),
        }
    }
}

struct Queues {
    intake: mpsc::Receiver<FetchTask>,
    retry: mpsc::UnboundedReceiver<FetchTask>,
}

struct PoolInner {
    renderer: Arc<dyn Renderer>,
    sessions: Arc<SessionStore>,
    challenges: Arc<ChallengeController>,
    gate: Arc<OriginGate>,
    classifier: ResponseClassifier,
    policy: RetryPolicy,
    state: Arc<SharedState>,
    settings: PoolSettings,
    queues: Mutex<Queues>,
    retry_tx: mpsc::UnboundedSender<FetchTask>,
    /// Delayed requeues still sleeping
    sleepers: TaskTracker,
    /// Submitted tasks without a terminal outcome yet
    outstanding: AtomicUsize,
    closed: AtomicBool,
    drained: CancellationToken,
}

pub struct FetchWorkerPool {
    inner: Arc<PoolInner>,
    intake: StdMutex<Option<mpsc::Sender<FetchTask>>>,
}

impl FetchWorkerPool {
    #[must_use]
    pub fn new(
        renderer: Arc<dyn Renderer>,
        sessions: Arc<SessionStore>,
        challenges: Arc<ChallengeController>,
        policy: RetryPolicy,
        state: Arc<SharedState>,
        settings: PoolSettings,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let inner = PoolInner {
            renderer,
            sessions,
            gate: Arc::clone(challenges.gate()),
            challenges,
            classifier: ResponseClassifier::new(),
            policy,
            state,
            settings,
            queues: Mutex::new(Queues {
                intake: intake_rx,
                retry: retry_rx,
            }),
            retry_tx,
            sleepers: TaskTracker::new(),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
            intake: StdMutex::new(Some(intake_tx)),
        }
    }

    #[must_use]
    pub fn from_config(
        config: &AppConfig,
        renderer: Arc<dyn Renderer>,
        sessions: Arc<SessionStore>,
        challenges: Arc<ChallengeController>,
        state: Arc<SharedState>,
    ) -> Self {
        Self::new(
            renderer,
            sessions,
            challenges,
            RetryPolicy::from_config(config),
            state,
            PoolSettings::from_config(config),
        )
    }

    /// Spawns the workers. The returned handle finishes once the pool is
    /// closed and drained, or cancelled; the outcome stream ends with it.
    /// Call once per pool.
    pub fn start(&self) -> (JoinHandle<()>, mpsc::Receiver<FetchOutcome>) {
        let (outcomes_tx, outcomes_rx) = mpsc::channel(self.inner.settings.queue_capacity);
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            info!("🚀 Starting {} fetch workers", inner.settings.concurrency);
            let workers: Vec<JoinHandle<()>> = (0..inner.settings.concurrency)
                .map(|worker_id| tokio::spawn(worker_loop(worker_id, Arc::clone(&inner), outcomes_tx.clone())))
                .collect();
            for joined in futures::future::join_all(workers).await {
                if let Err(e) = joined {
                    error!("Fetch worker panicked: {}", e);
                }
            }
            // Sleeping requeues either fail themselves on cancel or land in
            // the retry queue before it is drained.
            inner.sleepers.close();
            inner.sleepers.wait().await;
            inner.drain_cancelled(&outcomes_tx).await;
            let left = inner.outstanding.load(Ordering::SeqCst);
            if left > 0 {
                error!("{} task(s) ended without an outcome", left);
            }
            info!("🏁 Fetch pool stopped");
        });

        (handle, outcomes_rx)
    }

    /// Validates `raw` and queues it, waiting while the intake is full.
    pub async fn submit(&self, raw: &str) -> Result<TaskId, ImportError> {
        let (marketplace, url) = Marketplace::parse_product_url(raw)?;
        let sender = self
            .intake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ImportError::Cancelled)?;

        let task = FetchTask::new(url, marketplace);
        let id = task.id;
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        let sent = tokio::select! {
            biased;
            () = self.inner.state.cancellation_token.cancelled() => false,
            sent = sender.send(task) => sent.is_ok(),
        };
        if !sent {
            self.inner.finish();
            return Err(ImportError::Cancelled);
        }
        self.inner.state.stats.write().await.submitted += 1;
        debug!("Queued {} for {}", id, marketplace);
        Ok(id)
    }

    /// Ends submission; workers stop once every queued task has finished.
    pub fn close(&self) {
        drop(self.intake.lock().unwrap_or_else(PoisonError::into_inner).take());
        self.inner.closed.store(true, Ordering::SeqCst);
        if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
            self.inner.drained.cancel();
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<PoolInner>, outcomes: mpsc::Sender<FetchOutcome>) {
    debug!("Worker {} started", worker_id);
    loop {
        let next = {
            let mut queues = inner.queues.lock().await;
            let Queues { intake, retry } = &mut *queues;
            tokio::select! {
                biased;
                () = inner.state.cancellation_token.cancelled() => None,
                () = inner.drained.cancelled() => None,
                Some(task) = retry.recv() => Some(task),
                Some(task) = intake.recv() => Some(task),
                else => None,
            }
        };
        let Some(task) = next else { break };
        inner.process(task, &outcomes).await;
    }
    debug!("Worker {} stopped", worker_id);
}

/// Counts the attempt against the budget its classification draws on.
fn bump_counters(task: &mut FetchTask, classification: &Classification) {
    match classification {
        Classification::Transport { .. } => task.transport_retries += 1,
        Classification::RateLimited { .. } => task.rate_limit_retries += 1,
        Classification::AuthRequired => task.auth_failures += 1,
        Classification::Challenge { .. } => task.challenge_rounds += 1,
        Classification::Ok | Classification::Rejected { .. } | Classification::RendererUnavailable(_) => {}
    }
}

fn session_changed(used: &Session, returned: &Session) -> bool {
    used.status != SessionStatus::Valid || used.cookies != returned.cookies
}

impl PoolInner {
    async fn process(self: &Arc<Self>, mut task: FetchTask, outcomes: &mpsc::Sender<FetchOutcome>) {
        if let Err(e) = task.start() {
            error!("Dropping task {}: {}", task.id, e);
            self.finish();
            return;
        }
        if !self.wait_for_origin(&task.origin).await {
            self.fail(task, ImportError::Cancelled, outcomes).await;
            return;
        }

        let session = self.sessions.current_or_anonymous(&task.origin).await;
        let request = RenderRequest::new(task.url.clone(), Arc::clone(&session)).with_referer(task.marketplace.home_url());
        self.state.stats.write().await.renders += 1;
        debug!("🌐 Rendering {} (attempt {})", task.url, task.attempts);

        let timeout = self.settings.request_timeout;
        let result = match tokio::time::timeout(timeout, self.renderer.render(request)).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout {
                url: task.url.to_string(),
                seconds: timeout.as_secs(),
            }),
        };
        let (page, returned_session) = match result {
            Ok(response) => (Ok(response.page), Some(response.session)),
            Err(e) => (Err(e), None),
        };

        let classification = self.classifier.classify_result(&page, task.marketplace);
        let decision = self.policy.decide(&task, &classification);
        bump_counters(&mut task, &classification);

        match decision {
            Decision::Forward => match page {
                Ok(page) => {
                    if let Some(returned) = returned_session {
                        if session_changed(&session, &returned) {
                            self.challenges.commit_session(&session, returned).await;
                        }
                    }
                    self.forward(task, page, outcomes).await;
                }
                Err(e) => {
                    let error = ImportError::network(task.url.as_str(), e.to_string());
                    self.fail(task, error, outcomes).await;
                }
            },
            Decision::Requeue { delay } => {
                let reason = format!("{:?}", classification);
                self.requeue(task, self.policy.jittered(delay), reason, outcomes).await;
            }
            Decision::Backoff { delay } => {
                let delay = self.policy.jittered(delay);
                warn!("🐢 {} rate limited, pausing origin for {:?}", task.origin, delay);
                self.gate.backoff().pause(&task.origin, delay);
                self.requeue(task, Duration::ZERO, "rate limited".to_string(), outcomes).await;
            }
            Decision::DelegateChallenge => {
                let content = page.map(|p| p.content).unwrap_or_default();
                self.solve_challenge(task, classification, content, session, outcomes).await;
            }
            Decision::Reauthenticate => self.reauthenticate(task, outcomes).await,
            Decision::Fail(error) => self.fail(task, error, outcomes).await,
            Decision::Abort(error) => {
                self.state.abort(error.clone());
                self.fail(task, error, outcomes).await;
            }
        }
    }

    /// Waits until the origin's gate admits another render. `false` when
    /// the run was cancelled meanwhile.
    async fn wait_for_origin(&self, origin: &Origin) -> bool {
        tokio::select! {
            biased;
            () = self.state.cancellation_token.cancelled() => false,
            () = self.gate.admit(origin) => true,
        }
    }

    async fn solve_challenge(
        self: &Arc<Self>,
        task: FetchTask,
        classification: Classification,
        content: String,
        session: Arc<Session>,
        outcomes: &mpsc::Sender<FetchOutcome>,
    ) {
        let Classification::Challenge { kind, site_key } = classification else {
            let error = ImportError::unsolvable(task.url.as_str(), "no challenge detected");
            self.fail(task, error, outcomes).await;
            return;
        };
        self.state.stats.write().await.challenges_detected += 1;

        let challenge = Challenge::new(&task, kind, site_key, content);
        let report = self.challenges.resolve(challenge, session).await;
        if report.is_solved() {
            self.state.stats.write().await.challenges_solved += 1;
            self.requeue(task, Duration::ZERO, "challenge solved".to_string(), outcomes).await;
        } else {
            self.fail(task, report.into_error(), outcomes).await;
        }
    }

    async fn reauthenticate(self: &Arc<Self>, mut task: FetchTask, outcomes: &mpsc::Sender<FetchOutcome>) {
        task.auth_failures = 0;
        task.auth_refreshes += 1;
        self.state.stats.write().await.reauthentications += 1;
        warn!("🔒 Session for {} expired, re-authenticating", task.origin);

        if let Err(e) = self.sessions.invalidate(&task.origin).await {
            warn!("Could not drop expired session for {}: {}", task.origin, e);
        }
        match self.challenges.reauthenticate(&task.origin, task.marketplace).await {
            Ok(_) => self.requeue(task, Duration::ZERO, "re-authenticated".to_string(), outcomes).await,
            Err(error) => self.fail(task, error, outcomes).await,
        }
    }

    /// Puts `task` back on the retry queue. Without a delay it is queued
    /// before this returns; otherwise a tracked sleeper queues it later, or
    /// fails it if the run is cancelled first.
    async fn requeue(
        self: &Arc<Self>,
        mut task: FetchTask,
        delay: Duration,
        reason: String,
        outcomes: &mpsc::Sender<FetchOutcome>,
    ) {
        if let Err(e) = task.requeue(reason) {
            error!("Cannot requeue task {}: {}", task.id, e);
            self.finish();
            return;
        }
        self.state.stats.write().await.requeued += 1;
        debug!("🔁 Requeueing {} in {:?}", task.url, delay);

        if delay.is_zero() {
            self.enqueue_retry(task, outcomes).await;
            return;
        }
        let inner = Arc::clone(self);
        let outcomes = outcomes.clone();
        self.sleepers.spawn(async move {
            tokio::select! {
                biased;
                () = inner.state.cancellation_token.cancelled() => inner.cancel_queued(task, &outcomes).await,
                () = tokio::time::sleep(delay) => inner.enqueue_retry(task, &outcomes).await,
            }
        });
    }

    async fn enqueue_retry(&self, task: FetchTask, outcomes: &mpsc::Sender<FetchOutcome>) {
        if let Err(mpsc::error::SendError(task)) = self.retry_tx.send(task) {
            self.cancel_queued(task, outcomes).await;
        }
    }

    async fn forward(&self, mut task: FetchTask, page: RenderedPage, outcomes: &mpsc::Sender<FetchOutcome>) {
        if let Err(e) = task.complete() {
            error!("Task {} cannot complete: {}", task.id, e);
        }
        self.state.stats.write().await.pages_fetched += 1;
        info!("📄 Fetched {} after {} attempt(s)", task.url, task.attempts);
        emit(outcomes, FetchOutcome::Fetched { task, page }).await;
        self.finish();
    }

    async fn fail(&self, mut task: FetchTask, error: ImportError, outcomes: &mpsc::Sender<FetchOutcome>) {
        if let Err(e) = task.fail(error.kind(), error.to_string()) {
            error!("Task {} cannot fail: {}", task.id, e);
        }
        warn!("❌ {} failed: {}", task.url, error);
        emit(outcomes, FetchOutcome::Failed { task, error }).await;
        self.finish();
    }

    async fn cancel_queued(&self, task: FetchTask, outcomes: &mpsc::Sender<FetchOutcome>) {
        self.fail(task, ImportError::Cancelled, outcomes).await;
    }

    /// Fails whatever is still queued after a cancelled run.
    async fn drain_cancelled(&self, outcomes: &mpsc::Sender<FetchOutcome>) {
        if !self.state.is_shutdown_requested() {
            return;
        }
        let mut queues = self.queues.lock().await;
        let mut drained = Vec::new();
        while let Ok(task) = queues.retry.try_recv() {
            drained.push(task);
        }
        while let Ok(task) = queues.intake.try_recv() {
            drained.push(task);
        }
        drop(queues);

        if !drained.is_empty() {
            info!("🧹 Cancelling {} queued task(s)", drained.len());
        }
        for task in drained {
            self.cancel_queued(task, outcomes).await;
        }
    }

    fn finish(&self) {
        let before = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if before == 1 && self.closed.load(Ordering::SeqCst) {
            self.drained.cancel();
        }
    }
}

async fn emit(outcomes: &mpsc::Sender<FetchOutcome>, outcome: FetchOutcome) {
    if outcomes.send(outcome).await.is_err() {
        debug!("Outcome receiver dropped");
    }
}
