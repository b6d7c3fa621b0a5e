//! # Challenge handling
//!
//! When a render comes back blocked, the worker hands a [`Challenge`] to the
//! [`ChallengeController`]. The controller walks the configured strategies in
//! order, each attempt under its own timeout, until one of them produces a
//! session that renders the target page cleanly.
//!
//! Refreshes are serialized per origin: a second task blocked on the same
//! origin waits for the first one and reuses its session instead of solving
//! again. Cookie updates from ordinary renders go through the same lock, so
//! they never replace a session refreshed while they were in flight.
//!
//! Strategy renders pass the shared [`OriginGate`] like any fetch attempt.

#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::crawling::classifier::{ChallengeKind, Classification, ResponseClassifier};
use crate::domain::errors::ImportError;
use crate::domain::marketplace::{Marketplace, Origin};
use crate::domain::session::Session;
use crate::domain::task::{FetchTask, TaskId};
use crate::infrastructure::config::{ChallengeConfig, StrategyKind};
use crate::infrastructure::rate_limiter::OriginGate;
use crate::infrastructure::renderer::{RenderError, RenderRequest, RenderResponse, Renderer};
use crate::infrastructure::session_store::SessionStore;
use crate::infrastructure::solving_service::{CaptchaKind, SolveRequest, SolverError, SolvingService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeOutcome {
    Pending,
    Solved,
    Unsolved,
}

/// A blocked render waiting to be solved.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub task_id: TaskId,
    pub url: Url,
    pub origin: Origin,
    pub marketplace: Marketplace,
    pub kind: ChallengeKind,
    pub site_key: Option<String>,
    /// Page content that carried the challenge
    pub content: String,
    pub detected_at: DateTime<Utc>,
    /// Last strategy that was tried
    pub strategy: Option<StrategyKind>,
    pub outcome: ChallengeOutcome,
}

impl Challenge {
    #[must_use]
    pub fn new(task: &FetchTask, kind: ChallengeKind, site_key: Option<String>, content: String) -> Self {
        Self {
            task_id: task.id,
            url: task.url.clone(),
            origin: task.origin.clone(),
            marketplace: task.marketplace,
            kind,
            site_key,
            content,
            detected_at: Utc::now(),
            strategy: None,
            outcome: ChallengeOutcome::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeState {
    Idle,
    ChallengeDetected,
    Solving,
    Solved,
    Unsolved,
}

impl ChallengeState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::ChallengeDetected)
                // another task refreshed the session while this one waited
                | (Self::ChallengeDetected, Self::Solved)
                | (Self::ChallengeDetected, Self::Solving)
                | (Self::Solving, Self::Solved)
                | (Self::Solving, Self::Unsolved)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Solved | Self::Unsolved)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal challenge transition {from:?} -> {to:?}")]
pub struct ChallengeTransitionError {
    pub from: ChallengeState,
    pub to: ChallengeState,
}

/// Per-task state machine; keeps every state it passed through.
#[derive(Debug, Clone)]
pub struct ChallengeMachine {
    history: Vec<ChallengeState>,
}

impl ChallengeMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            history: vec![ChallengeState::Idle],
        }
    }

    #[must_use]
    pub fn state(&self) -> ChallengeState {
        self.history.last().copied().unwrap_or(ChallengeState::Idle)
    }

    pub fn advance(&mut self, next: ChallengeState) -> Result<(), ChallengeTransitionError> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(ChallengeTransitionError { from, to: next });
        }
        self.history.push(next);
        Ok(())
    }

    #[must_use]
    pub fn history(&self) -> &[ChallengeState] {
        &self.history
    }
}

impl Default for ChallengeMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// What the controller did with one challenge.
#[derive(Debug, Clone)]
pub struct ChallengeReport {
    pub challenge: Challenge,
    pub transitions: Vec<ChallengeState>,
    /// The refreshed session when solved
    pub session: Option<Arc<Session>>,
}

impl ChallengeReport {
    #[must_use]
    pub fn is_solved(&self) -> bool {
        self.challenge.outcome == ChallengeOutcome::Solved
    }

    /// Terminal error for an unsolved challenge.
    #[must_use]
    pub fn into_error(self) -> ImportError {
        let reason = match self.challenge.strategy {
            Some(strategy) => format!("{:?} challenge survived {:?}", self.challenge.kind, strategy),
            None => format!("no strategy applies to {:?} challenge", self.challenge.kind),
        };
        ImportError::unsolvable(self.challenge.url.as_str(), reason)
    }
}

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("target still blocked: {0}")]
    StillBlocked(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("strategy setup failed: {0}")]
    Setup(String),
}

pub struct StrategyContext<'a> {
    pub challenge: &'a Challenge,
    /// Session the blocked render used
    pub session: Arc<Session>,
    pub renderer: &'a dyn Renderer,
    pub gate: &'a OriginGate,
    /// 1-based pass over the strategy list
    pub round: u32,
}

impl StrategyContext<'_> {
    /// Renders once the request's origin admits another request.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderResponse, RenderError> {
        self.gate.admit(&Origin::of(&request.url)).await;
        self.renderer.render(request).await
    }
}

#[async_trait]
pub trait ChallengeStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn applies_to(&self, _challenge: &Challenge) -> bool {
        true
    }

    /// Returns a session under which the target renders cleanly.
    async fn attempt(&self, ctx: StrategyContext<'_>) -> Result<Session, StrategyError>;
}

/// Re-renders the target with `session` and accepts only a clean page.
pub async fn verify(
    ctx: &StrategyContext<'_>,
    session: Session,
    referer: Option<&str>,
) -> Result<Session, StrategyError> {
    let challenge = ctx.challenge;
    let mut request = RenderRequest::new(challenge.url.clone(), Arc::new(session));
    if let Some(referer) = referer {
        request = request.with_referer(referer);
    }
    let response = ctx.render(request).await?;
    match ResponseClassifier::new().classify(&response.page, challenge.marketplace) {
        Classification::Ok => Ok(response.session),
        other => Err(StrategyError::StillBlocked(format!("{:?}", other))),
    }
}

/// Visits the marketplace home page to pick up fresh cookies first.
#[derive(Debug, Default)]
pub struct HomepageWarmup;

#[async_trait]
impl ChallengeStrategy for HomepageWarmup {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HomepageWarmup
    }

    async fn attempt(&self, ctx: StrategyContext<'_>) -> Result<Session, StrategyError> {
        let home_url = ctx.challenge.marketplace.home_url();
        let home = Url::parse(home_url).map_err(|e| StrategyError::Setup(e.to_string()))?;
        let warmed = ctx.render(RenderRequest::new(home, Arc::clone(&ctx.session))).await?;
        debug!(
            "Home page warm-up for {} returned {} with {} cookies",
            ctx.challenge.origin,
            warmed.page.status,
            warmed.session.cookies.len()
        );
        verify(&ctx, warmed.session, Some(home_url)).await
    }
}

/// Hands captcha widgets to an external solving service.
pub struct SolvingServiceStrategy {
    service: Arc<dyn SolvingService>,
}

impl SolvingServiceStrategy {
    #[must_use]
    pub fn new(service: Arc<dyn SolvingService>) -> Self {
        Self { service }
    }

    const fn token_cookie(kind: CaptchaKind) -> &'static str {
        match kind {
            CaptchaKind::RecaptchaV2 => "g-recaptcha-response",
            CaptchaKind::HCaptcha => "h-captcha-response",
        }
    }
}

#[async_trait]
impl ChallengeStrategy for SolvingServiceStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SolvingService
    }

    fn applies_to(&self, challenge: &Challenge) -> bool {
        matches!(challenge.kind, ChallengeKind::Captcha(_)) && challenge.site_key.is_some()
    }

    async fn attempt(&self, ctx: StrategyContext<'_>) -> Result<Session, StrategyError> {
        let (ChallengeKind::Captcha(kind), Some(site_key)) = (ctx.challenge.kind, ctx.challenge.site_key.clone())
        else {
            return Err(StrategyError::Setup("challenge carries no captcha site key".to_string()));
        };
        let request = SolveRequest {
            kind,
            site_key,
            page_url: ctx.challenge.url.to_string(),
        };
        info!("🧩 Sending {:?} for {} to {}", kind, ctx.challenge.url, self.service.name());
        let token = self.service.solve(&request).await?;

        let session = ctx
            .session
            .with_cookies(&BTreeMap::from([(Self::token_cookie(kind).to_string(), token)]));
        verify(&ctx, session, None).await
    }
}

/// Waits out soft blocks, a little longer each round.
#[derive(Debug)]
pub struct BackoffWait {
    base: Duration,
}

impl BackoffWait {
    #[must_use]
    pub const fn new(base: Duration) -> Self {
        Self { base }
    }

    #[must_use]
    pub fn wait_for_round(&self, round: u32) -> Duration {
        let grown = self.base.saturating_mul(round.max(1));
        grown.mul_f64(1.0 + fastrand::f64() * 0.25)
    }
}

#[async_trait]
impl ChallengeStrategy for BackoffWait {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BackoffWait
    }

    async fn attempt(&self, ctx: StrategyContext<'_>) -> Result<Session, StrategyError> {
        let wait = self.wait_for_round(ctx.round);
        debug!("⏳ Backing off {:?} before retrying {}", wait, ctx.challenge.url);
        tokio::time::sleep(wait).await;
        let session = ctx.session.as_ref().clone();
        verify(&ctx, session, None).await
    }
}

pub struct ChallengeController {
    renderer: Arc<dyn Renderer>,
    sessions: Arc<SessionStore>,
    strategies: Vec<Arc<dyn ChallengeStrategy>>,
    strategy_timeout: Duration,
    max_attempts: u32,
    gate: Arc<OriginGate>,
    origin_locks: StdMutex<HashMap<Origin, Arc<Mutex<()>>>>,
}

impl ChallengeController {
    #[must_use]
    pub fn new(
        renderer: Arc<dyn Renderer>,
        sessions: Arc<SessionStore>,
        strategies: Vec<Arc<dyn ChallengeStrategy>>,
        strategy_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            renderer,
            sessions,
            strategies,
            strategy_timeout,
            max_attempts,
            gate: Arc::new(OriginGate::unlimited()),
            origin_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Shares `gate` with the fetch workers.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<OriginGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Builds the configured strategy list; `solving_service` is skipped
    /// when no service is available.
    #[must_use]
    pub fn from_config(
        config: &ChallengeConfig,
        gate: Arc<OriginGate>,
        renderer: Arc<dyn Renderer>,
        sessions: Arc<SessionStore>,
        solver: Option<Arc<dyn SolvingService>>,
    ) -> Self {
        let mut strategies: Vec<Arc<dyn ChallengeStrategy>> = Vec::new();
        for kind in &config.strategies {
            match kind {
                StrategyKind::HomepageWarmup => strategies.push(Arc::new(HomepageWarmup)),
                StrategyKind::BackoffWait => {
                    strategies.push(Arc::new(BackoffWait::new(Duration::from_millis(config.backoff_wait_ms))));
                }
                StrategyKind::SolvingService => match &solver {
                    Some(service) => strategies.push(Arc::new(SolvingServiceStrategy::new(Arc::clone(service)))),
                    None => info!("No solving service configured, skipping that strategy"),
                },
            }
        }
        Self::new(
            renderer,
            sessions,
            strategies,
            Duration::from_secs(config.strategy_timeout_seconds),
            config.max_attempts,
        )
        .with_gate(gate)
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<OriginGate> {
        &self.gate
    }

    #[must_use]
    pub fn strategy_order(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    fn origin_lock(&self, origin: &Origin) -> Arc<Mutex<()>> {
        let mut locks = self.origin_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(origin.clone()).or_default())
    }

    async fn persist(&self, session: Session) -> Arc<Session> {
        match self.sessions.save(session.clone()).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!("⚠️ Refreshed session for {} not persisted: {}", session.origin, e);
                Arc::new(session)
            }
        }
    }

    /// Stores the cookies a clean render came back with. When the origin's
    /// session was replaced while that render was in flight, only the
    /// cookies the render changed are layered onto the newer session.
    pub async fn commit_session(&self, used: &Session, returned: Session) {
        let lock = self.origin_lock(&used.origin);
        let _guard = lock.lock().await;

        let next = match self.sessions.load(&used.origin).await {
            Some(current) if !same_generation(&current, used) => {
                let changed: BTreeMap<String, String> = returned
                    .cookies
                    .into_iter()
                    .filter(|(name, value)| used.cookies.get(name) != Some(value))
                    .collect();
                if changed.is_empty() {
                    return;
                }
                debug!("Merging {} cookie(s) into the newer session for {}", changed.len(), used.origin);
                current.with_cookies(&changed)
            }
            _ => Session {
                origin: used.origin.clone(),
                ..returned
            }
            .validated(),
        };
        if let Err(e) = self.sessions.save(next).await {
            warn!("⚠️ Could not persist session for {}: {}", used.origin, e);
        }
    }

    pub async fn resolve(&self, mut challenge: Challenge, session: Arc<Session>) -> ChallengeReport {
        let mut machine = ChallengeMachine::new();
        step(&mut machine, ChallengeState::ChallengeDetected);
        info!("🚧 {:?} challenge on {}", challenge.kind, challenge.url);

        let lock = self.origin_lock(&challenge.origin);
        let _guard = lock.lock().await;

        if let Some(current) = self.sessions.load(&challenge.origin).await {
            if current.validated_at > challenge.detected_at {
                debug!("Session for {} was refreshed while waiting", challenge.origin);
                step(&mut machine, ChallengeState::Solved);
                challenge.outcome = ChallengeOutcome::Solved;
                return ChallengeReport {
                    challenge,
                    transitions: machine.history().to_vec(),
                    session: Some(current),
                };
            }
        }

        step(&mut machine, ChallengeState::Solving);
        for round in 1..=self.max_attempts {
            for strategy in &self.strategies {
                if !strategy.applies_to(&challenge) {
                    continue;
                }
                challenge.strategy = Some(strategy.kind());
                let ctx = StrategyContext {
                    challenge: &challenge,
                    session: Arc::clone(&session),
                    renderer: self.renderer.as_ref(),
                    gate: self.gate.as_ref(),
                    round,
                };
                match tokio::time::timeout(self.strategy_timeout, strategy.attempt(ctx)).await {
                    Ok(Ok(refreshed)) => {
                        let saved = self.persist(refreshed.validated()).await;
                        info!("✅ {:?} solved {} (round {})", strategy.kind(), challenge.url, round);
                        step(&mut machine, ChallengeState::Solved);
                        challenge.outcome = ChallengeOutcome::Solved;
                        return ChallengeReport {
                            challenge,
                            transitions: machine.history().to_vec(),
                            session: Some(saved),
                        };
                    }
                    Ok(Err(e)) => warn!("{:?} failed for {}: {}", strategy.kind(), challenge.url, e),
                    Err(_) => warn!(
                        "{:?} timed out after {:?} for {}",
                        strategy.kind(),
                        self.strategy_timeout,
                        challenge.url
                    ),
                }
            }
        }

        warn!("❌ Challenge on {} left unsolved", challenge.url);
        step(&mut machine, ChallengeState::Unsolved);
        challenge.outcome = ChallengeOutcome::Unsolved;
        ChallengeReport {
            challenge,
            transitions: machine.history().to_vec(),
            session: None,
        }
    }

    /// Forced re-login: home page visit with an empty session, saved as the
    /// origin's new current session.
    pub async fn reauthenticate(&self, origin: &Origin, marketplace: Marketplace) -> Result<Arc<Session>, ImportError> {
        let expired = || ImportError::SessionExpired {
            origin: origin.to_string(),
        };
        let lock = self.origin_lock(origin);
        let _guard = lock.lock().await;

        let home = Url::parse(marketplace.home_url()).map_err(|_| expired())?;
        self.gate.admit(&Origin::of(&home)).await;
        let request = RenderRequest::new(home, Arc::new(Session::anonymous(origin.clone())));
        let response = match tokio::time::timeout(self.strategy_timeout, self.renderer.render(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Re-authentication render failed for {}: {}", origin, e);
                return Err(expired());
            }
            Err(_) => return Err(expired()),
        };
        if response.page.status >= 400 {
            return Err(expired());
        }

        let mut session = response.session;
        session.origin = origin.clone();
        info!("🔑 Re-authenticated {}", origin);
        Ok(self.persist(session.validated()).await)
    }
}

fn same_generation(current: &Session, used: &Session) -> bool {
    current.validated_at == used.validated_at && current.cookies == used.cookies
}

fn step(machine: &mut ChallengeMachine, next: ChallengeState) {
    if let Err(e) = machine.advance(next) {
        warn!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::cookie_storage::MemoryCookieStorage;
    use crate::infrastructure::rate_limiter::OriginRateLimiter;
    use crate::test_utils::{MockSolver, ScriptedPage, ScriptedRenderer, product_page};
    use std::num::NonZeroU32;

    const OFFER: &str = "https://detail.1688.com/offer/623456789012.html";

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(Arc::new(MemoryCookieStorage::new()), chrono::Duration::hours(1)))
    }

    fn challenge(kind: ChallengeKind, site_key: Option<&str>) -> Challenge {
        let task = FetchTask::new(Url::parse(OFFER).unwrap(), Marketplace::Alibaba1688);
        Challenge::new(&task, kind, site_key.map(str::to_string), String::new())
    }

    fn anonymous() -> Arc<Session> {
        Arc::new(Session::anonymous(Origin::parse(OFFER).unwrap()))
    }

    #[test]
    fn test_state_machine_rejects_illegal_transitions() {
        let mut machine = ChallengeMachine::new();
        assert!(machine.advance(ChallengeState::Solving).is_err());
        machine.advance(ChallengeState::ChallengeDetected).unwrap();
        machine.advance(ChallengeState::Solving).unwrap();
        machine.advance(ChallengeState::Unsolved).unwrap();
        assert!(machine.advance(ChallengeState::Solved).is_err());
        assert!(machine.state().is_terminal());
        assert_eq!(machine.history().len(), 4);
    }

    #[tokio::test]
    async fn test_homepage_warmup_solves_and_persists() {
        let renderer = Arc::new(
            ScriptedRenderer::new()
                .script(Marketplace::Alibaba1688.home_url(), vec![ScriptedPage::ok("<html>home</html>").with_cookie("cna", "fresh")])
                .script(OFFER, vec![ScriptedPage::ok(&product_page(Marketplace::Alibaba1688))]),
        );
        let sessions = store();
        let controller = ChallengeController::new(
            renderer.clone(),
            Arc::clone(&sessions),
            vec![Arc::new(HomepageWarmup)],
            Duration::from_secs(5),
            1,
        );

        let report = controller
            .resolve(challenge(ChallengeKind::Slider, None), anonymous())
            .await;
        assert!(report.is_solved());
        assert_eq!(
            report.transitions,
            vec![
                ChallengeState::Idle,
                ChallengeState::ChallengeDetected,
                ChallengeState::Solving,
                ChallengeState::Solved
            ]
        );

        let stored = sessions.load(&Origin::parse(OFFER).unwrap()).await.unwrap();
        assert_eq!(stored.cookies.get("cna").map(String::as_str), Some("fresh"));
        // the verifying render carried the warmed cookie
        assert_eq!(renderer.calls_to(OFFER)[0].cookie.as_deref(), Some("cna=fresh"));
    }

    #[tokio::test]
    async fn test_solver_only_runs_for_captcha_with_site_key() {
        let renderer = Arc::new(
            ScriptedRenderer::new().script(OFFER, vec![ScriptedPage::ok(&product_page(Marketplace::Alibaba1688))]),
        );
        let solver = Arc::new(MockSolver::succeeding("tok-123"));
        let controller = ChallengeController::new(
            renderer.clone(),
            store(),
            vec![Arc::new(SolvingServiceStrategy::new(solver.clone()))],
            Duration::from_secs(5),
            2,
        );

        let report = controller
            .resolve(challenge(ChallengeKind::Slider, None), anonymous())
            .await;
        assert!(!report.is_solved());
        assert_eq!(solver.calls(), 0);
        assert!(matches!(report.into_error(), ImportError::CaptchaUnsolvable { .. }));

        let report = controller
            .resolve(
                challenge(ChallengeKind::Captcha(CaptchaKind::RecaptchaV2), Some("site")),
                anonymous(),
            )
            .await;
        assert!(report.is_solved());
        assert_eq!(solver.calls(), 1);
        assert_eq!(
            report.session.unwrap().cookies.get("g-recaptcha-response").map(String::as_str),
            Some("tok-123")
        );
    }

    #[tokio::test]
    async fn test_unsolved_after_all_rounds() {
        let blocked = r#"<span class="nc_iconfont btn_slide"></span>"#;
        let renderer = Arc::new(ScriptedRenderer::new().script(OFFER, vec![ScriptedPage::ok(blocked)]));
        let controller = ChallengeController::new(
            renderer.clone(),
            store(),
            vec![Arc::new(BackoffWait::new(Duration::from_millis(1)))],
            Duration::from_secs(5),
            3,
        );

        let report = controller
            .resolve(challenge(ChallengeKind::Slider, None), anonymous())
            .await;
        assert_eq!(report.challenge.outcome, ChallengeOutcome::Unsolved);
        assert_eq!(report.challenge.strategy, Some(StrategyKind::BackoffWait));
        assert_eq!(renderer.calls_to(OFFER).len(), 3);
    }

    #[tokio::test]
    async fn test_waiter_reuses_session_refreshed_meanwhile() {
        let renderer = Arc::new(ScriptedRenderer::new());
        let sessions = store();
        let controller = ChallengeController::new(
            renderer.clone(),
            Arc::clone(&sessions),
            vec![Arc::new(HomepageWarmup)],
            Duration::from_secs(5),
            1,
        );

        let stale = challenge(ChallengeKind::Slider, None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        sessions
            .save(Session::anonymous(Origin::parse(OFFER).unwrap()).validated())
            .await
            .unwrap();

        let report = controller.resolve(stale, anonymous()).await;
        assert!(report.is_solved());
        assert_eq!(report.challenge.strategy, None);
        assert!(renderer.calls().is_empty());
    }

    #[tokio::test]
    async fn test_strategy_renders_take_rate_permits() {
        let blocked = r#"<span class="nc_iconfont btn_slide"></span>"#;
        let renderer = Arc::new(ScriptedRenderer::new().script(OFFER, vec![ScriptedPage::ok(blocked)]));
        let gate = Arc::new(OriginGate::new(Some(OriginRateLimiter::new(
            NonZeroU32::new(10).unwrap(),
            NonZeroU32::new(1).unwrap(),
        ))));
        let controller = ChallengeController::new(
            renderer.clone(),
            store(),
            vec![Arc::new(BackoffWait::new(Duration::from_millis(1)))],
            Duration::from_secs(5),
            3,
        )
        .with_gate(gate);

        let report = controller
            .resolve(challenge(ChallengeKind::Slider, None), anonymous())
            .await;
        assert!(!report.is_solved());
        let calls = renderer.calls_to(OFFER);
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(90));
        }
    }

    #[tokio::test]
    async fn test_commit_keeps_session_refreshed_during_render() {
        let sessions = store();
        let controller = ChallengeController::new(
            Arc::new(ScriptedRenderer::new()),
            Arc::clone(&sessions),
            Vec::new(),
            Duration::from_secs(5),
            1,
        );
        let origin = Origin::parse(OFFER).unwrap();
        let used = Session::anonymous(origin.clone()).with_cookies(&BTreeMap::from([("a".to_string(), "1".to_string())]));
        let solved = sessions
            .save(used.with_cookies(&BTreeMap::from([("solved".to_string(), "yes".to_string())])).validated())
            .await
            .unwrap();

        let returned = used.with_cookies(&BTreeMap::from([("c".to_string(), "1".to_string())]));
        controller.commit_session(&used, returned).await;

        let stored = sessions.load(&origin).await.unwrap();
        assert_eq!(stored.cookies.get("solved").map(String::as_str), Some("yes"));
        assert_eq!(stored.cookies.get("c").map(String::as_str), Some("1"));
        assert_eq!(stored.validated_at, solved.validated_at);
    }

    #[tokio::test]
    async fn test_commit_replaces_the_session_it_rendered_with() {
        let sessions = store();
        let controller = ChallengeController::new(
            Arc::new(ScriptedRenderer::new()),
            Arc::clone(&sessions),
            Vec::new(),
            Duration::from_secs(5),
            1,
        );
        let origin = Origin::parse(OFFER).unwrap();
        let used = sessions.save(Session::anonymous(origin.clone()).validated()).await.unwrap();

        let returned = used.with_cookies(&BTreeMap::from([("cna".to_string(), "rotated".to_string())]));
        controller.commit_session(&used, returned).await;

        let stored = sessions.load(&origin).await.unwrap();
        assert_eq!(stored.cookies.get("cna").map(String::as_str), Some("rotated"));
        assert!(stored.validated_at >= used.validated_at);
    }

    #[tokio::test]
    async fn test_reauthenticate_saves_fresh_session() {
        let renderer = Arc::new(ScriptedRenderer::new().script(
            Marketplace::Taobao.home_url(),
            vec![ScriptedPage::ok("<html>home</html>").with_cookie("_tb_token_", "t1")],
        ));
        let sessions = store();
        let controller = ChallengeController::new(renderer, Arc::clone(&sessions), Vec::new(), Duration::from_secs(5), 1);
        let origin = Origin::parse("https://item.taobao.com").unwrap();

        let session = controller.reauthenticate(&origin, Marketplace::Taobao).await.unwrap();
        assert_eq!(session.origin, origin);
        assert!(sessions.load(&origin).await.is_some());
    }
}
