//! The auth coordinator: one task that owns the session truth.
//!
//! Every trigger (mount, route change, sign-in/out, cross-context messages,
//! cookie removals, timers) becomes a [`Command`] on a single channel and is
//! processed to completion before the next one. Retries and polls are timer
//! tasks that post a command back; they never run coordinator logic
//! themselves, and a timer whose generation is stale is dropped.

use crate::auth_fsm::{CoordinatorInput, CoordinatorMachine, CoordinatorPhase};
use crate::context::AuthContext;
use crate::domain::CookieNames;
use crate::external_source::TokenOrigin;
use crate::transfer::TransferOutcome;
use crate::{AuthError, AuthResult, ErrorKind, SessionState, TokenPair, User};
use extension_auth_protocol::ExtensionMessage;
use extension_config_and_utils::{Config, TimingConfig, DEFAULT_LANDING_ROUTE};
use extension_storage::{normalize_domain, CookieChange, CookieChangeCause};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMMAND_QUEUE_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Something outside the coordinator says the session may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthSignal {
    /// The auth website finished a login (`authCompleted`).
    AuthCompleted,
    /// `checkAuthStatus` / `authStateChanged`: look again.
    Recheck,
    /// A proxied request failed for good (`authenticationFailed`).
    AuthenticationFailed,
    /// The backend access cookie was removed or expired.
    BackendCookieRemoved,
}

impl AuthSignal {
    /// The signal a cross-context message carries for the coordinator.
    pub fn from_message(message: ExtensionMessage) -> Option<Self> {
        match message {
            ExtensionMessage::GetTokensFromLocalStorage => None,
            ExtensionMessage::AuthCompleted => Some(AuthSignal::AuthCompleted),
            ExtensionMessage::CheckAuthStatus | ExtensionMessage::AuthStateChanged => {
                Some(AuthSignal::Recheck)
            }
            ExtensionMessage::AuthenticationFailed => Some(AuthSignal::AuthenticationFailed),
        }
    }
}

/// Routing and timing the coordinator runs with.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// The only route on which a mount starts an auth cycle.
    pub landing_route: String,
    pub timing: TimingConfig,
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            landing_route: config.landing_route.clone(),
            timing: config.timing.clone(),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            landing_route: DEFAULT_LANDING_ROUTE.to_string(),
            timing: TimingConfig::default(),
        }
    }
}

/// What the UI renders from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub phase: CoordinatorPhase,
    pub session: SessionState,
}

/// Notifications for UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    StateChanged(SessionState),
    /// Leave any protected route for the landing route.
    RedirectToLanding,
}

enum Command {
    Mount {
        route: String,
        done: oneshot::Sender<()>,
    },
    RouteChanged {
        route: String,
        done: oneshot::Sender<()>,
    },
    Signal {
        signal: AuthSignal,
        done: Option<oneshot::Sender<()>>,
    },
    SignIn {
        tokens: TokenPair,
        done: oneshot::Sender<AuthResult<()>>,
    },
    SignOut {
        done: oneshot::Sender<()>,
    },
    Timer {
        generation: u64,
        step: Step,
    },
    Heartbeat,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    CheckBackend,
    CheckExternal,
    Transfer,
    Verify,
    Retry,
    PollExternal,
}

enum Next {
    Now(Step),
    After(Duration, Step),
    Idle,
}

#[derive(Debug, Default)]
struct VerifyProgress {
    cookie_found: bool,
    cookie_attempts: u32,
    status_attempts: u32,
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CoordinatorSnapshot>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> AuthResult<T> {
        let (done, reply) = oneshot::channel();
        self.commands
            .send(make(done))
            .await
            .map_err(|_| AuthError::CoordinatorStopped)?;
        reply.await.map_err(|_| AuthError::CoordinatorStopped)
    }

    /// Mount the UI on `route` and wait for the resulting state to settle.
    pub async fn mount(&self, route: &str) -> AuthResult<SessionState> {
        let route = route.to_string();
        self.request(|done| Command::Mount { route, done }).await?;
        self.wait_settled().await
    }

    pub async fn route_changed(&self, route: &str) -> AuthResult<()> {
        let route = route.to_string();
        self.request(|done| Command::RouteChanged { route, done }).await
    }

    /// Ask the coordinator to look again and wait for the answer.
    pub async fn check_auth_status(&self) -> AuthResult<SessionState> {
        self.request(|done| Command::Signal {
            signal: AuthSignal::Recheck,
            done: Some(done),
        })
        .await?;
        self.wait_settled().await
    }

    /// Sign in with tokens obtained from fresh credentials.
    pub async fn sign_in(&self, tokens: TokenPair) -> AuthResult<SessionState> {
        self.request(|done| Command::SignIn { tokens, done }).await??;
        self.wait_settled().await
    }

    /// Registration yields a token pair just like sign-in.
    pub async fn sign_up(&self, tokens: TokenPair) -> AuthResult<SessionState> {
        self.sign_in(tokens).await
    }

    /// Sign out everywhere. Never fails; the returned state is logged out.
    pub async fn sign_out(&self) -> SessionState {
        if let Err(e) = self.request(|done| Command::SignOut { done }).await {
            warn!(error = %e, "sign-out could not reach the coordinator");
            return SessionState::unauthenticated(None);
        }
        self.session()
    }

    /// Deliver a signal without waiting for it to be processed.
    pub async fn notify(&self, signal: AuthSignal) -> AuthResult<()> {
        self.commands
            .send(Command::Signal { signal, done: None })
            .await
            .map_err(|_| AuthError::CoordinatorStopped)
    }

    pub fn session(&self) -> SessionState {
        self.snapshot.borrow().session.clone()
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.snapshot.borrow().phase
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Wait until no cycle is in flight.
    pub async fn wait_settled(&self) -> AuthResult<SessionState> {
        let mut snapshot = self.snapshot.clone();
        let settled = snapshot
            .wait_for(|s| s.phase.is_settled())
            .await
            .map_err(|_| AuthError::CoordinatorStopped)?;
        Ok(settled.session.clone())
    }

    /// Stop the coordinator and every timer it scheduled.
    pub async fn shutdown(&self) {
        if self.request(|done| Command::Shutdown { done }).await.is_err() {
            debug!("coordinator already stopped");
        }
    }
}

/// Start a coordinator task for `ctx`.
pub fn spawn(ctx: AuthContext, options: CoordinatorOptions) -> CoordinatorHandle {
    let (commands, inbox) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (snapshot, snapshot_rx) = watch::channel(CoordinatorSnapshot {
        phase: CoordinatorPhase::Init,
        session: SessionState::optimistic(),
    });
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let forwarders = vec![
        forward_bus(ctx.bus.subscribe(), commands.downgrade()),
        forward_cookie_removals(
            ctx.cookies.subscribe(),
            ctx.domains.backend_domain.clone(),
            commands.downgrade(),
        ),
    ];

    let coordinator = Coordinator {
        id: Uuid::new_v4(),
        ctx,
        options,
        machine: CoordinatorMachine::new(),
        session: SessionState::optimistic(),
        route: None,
        redirected: false,
        tokens: None,
        credentials: None,
        verify: VerifyProgress::default(),
        failures: 0,
        external_polls: 0,
        polling_suspended: false,
        last_error: None,
        surfaced_error: None,
        generation: 0,
        step_timer: None,
        heartbeat: None,
        commands: commands.downgrade(),
        snapshot,
        events: events.clone(),
    };
    tokio::spawn(coordinator.run(inbox, forwarders));

    CoordinatorHandle {
        commands,
        snapshot: snapshot_rx,
        events,
    }
}

fn forward_bus(
    mut messages: broadcast::Receiver<ExtensionMessage>,
    commands: mpsc::WeakSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match messages.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "coordinator missed bus messages");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(signal) = AuthSignal::from_message(message) else {
                continue;
            };
            let Some(commands) = commands.upgrade() else {
                break;
            };
            if commands.send(Command::Signal { signal, done: None }).await.is_err() {
                break;
            }
        }
    })
}

fn forward_cookie_removals(
    mut changes: broadcast::Receiver<CookieChange>,
    backend_domain: String,
    commands: mpsc::WeakSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "coordinator missed cookie changes");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !is_session_cookie_loss(&change, &backend_domain) {
                continue;
            }
            let Some(commands) = commands.upgrade() else {
                break;
            };
            let signal = AuthSignal::BackendCookieRemoved;
            if commands.send(Command::Signal { signal, done: None }).await.is_err() {
                break;
            }
        }
    })
}

/// Overwrites are part of a transfer, not a lost session.
fn is_session_cookie_loss(change: &CookieChange, backend_domain: &str) -> bool {
    change.removed
        && change.cause != CookieChangeCause::Overwrite
        && change.cookie.name == CookieNames::ACCESS_TOKEN
        && normalize_domain(&change.cookie.domain) == backend_domain
}

struct Coordinator {
    id: Uuid,
    ctx: AuthContext,
    options: CoordinatorOptions,
    machine: CoordinatorMachine,
    session: SessionState,
    route: Option<String>,
    /// A redirect was already requested for the current route.
    redirected: bool,
    /// Pair being transferred and verified in this cycle.
    tokens: Option<(TokenPair, TokenOrigin)>,
    /// Pair from `sign_in`, reused by retries until the cycle ends.
    credentials: Option<TokenPair>,
    verify: VerifyProgress,
    failures: u32,
    external_polls: u32,
    polling_suspended: bool,
    last_error: Option<ErrorKind>,
    /// Shown on the next settle into UNAUTHENTICATED.
    surfaced_error: Option<ErrorKind>,
    generation: u64,
    step_timer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    commands: mpsc::WeakSender<Command>,
    snapshot: watch::Sender<CoordinatorSnapshot>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl Coordinator {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>, forwarders: Vec<JoinHandle<()>>) {
        info!(coordinator_id = %self.id, "coordinator started");

        let mut shutdown_ack = None;
        while let Some(command) = inbox.recv().await {
            if let ControlFlow::Break(done) = self.handle(command).await {
                shutdown_ack = Some(done);
                break;
            }
        }

        self.cancel_step_timer();
        self.stop_heartbeat();
        for forwarder in forwarders {
            forwarder.abort();
        }
        info!(coordinator_id = %self.id, "coordinator stopped");

        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::Mount { route, done } => {
                self.on_mount(route).await;
                let _ = done.send(());
            }
            Command::RouteChanged { route, done } => {
                self.on_route_changed(route).await;
                let _ = done.send(());
            }
            Command::Signal { signal, done } => {
                self.on_signal(signal).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::SignIn { tokens, done } => {
                let result = self.on_sign_in(tokens).await;
                let _ = done.send(result);
            }
            Command::SignOut { done } => {
                self.sign_out(None).await;
                let _ = done.send(());
            }
            Command::Timer { generation, step } => {
                if generation != self.generation {
                    debug!(?step, "dropping stale timer");
                } else {
                    self.step_timer = None;
                    self.drive(step).await;
                }
            }
            Command::Heartbeat => self.on_heartbeat().await,
            Command::Shutdown { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    // ---- triggers ----

    async fn on_mount(&mut self, route: String) {
        self.set_route(route);
        match self.phase() {
            CoordinatorPhase::Init if self.on_landing_route() => self.start_cycle().await,
            CoordinatorPhase::Init => {
                debug!(route = ?self.route, "mounted on a protected route");
                self.session = SessionState {
                    is_loading: false,
                    ..SessionState::optimistic()
                };
                self.emit(CoordinatorEvent::StateChanged(self.session.clone()));
                self.publish();
                self.start_heartbeat();
            }
            _ => self.on_signal(AuthSignal::Recheck).await,
        }
    }

    async fn on_route_changed(&mut self, route: String) {
        self.set_route(route);
        match self.phase() {
            CoordinatorPhase::Init if self.on_landing_route() => self.start_cycle().await,
            CoordinatorPhase::Init => self.start_heartbeat(),
            CoordinatorPhase::Unauthenticated => self.redirect_if_protected(),
            _ => {}
        }
    }

    async fn on_signal(&mut self, signal: AuthSignal) {
        let phase = self.phase();
        match signal {
            AuthSignal::AuthCompleted | AuthSignal::Recheck => match phase {
                CoordinatorPhase::Authenticated => {
                    debug!(?signal, "already authenticated, ignoring");
                }
                CoordinatorPhase::Unauthenticated => {
                    self.cancel_step_timer();
                    self.external_polls = 0;
                    self.polling_suspended = false;
                    if self.apply(CoordinatorInput::PollExternal) {
                        self.drive(Step::CheckExternal).await;
                    }
                }
                CoordinatorPhase::Init if self.on_landing_route() => self.start_cycle().await,
                CoordinatorPhase::Init => {
                    debug!(?signal, "not on the landing route, ignoring");
                }
                _ => debug!(?signal, phase = ?phase, "cycle already running"),
            },
            AuthSignal::AuthenticationFailed | AuthSignal::BackendCookieRemoved => {
                if signal == AuthSignal::AuthenticationFailed {
                    self.surfaced_error = Some(ErrorKind::AuthenticationFailed);
                }
                match phase {
                    CoordinatorPhase::Authenticated => {
                        info!(?signal, "session lost");
                        self.stop_heartbeat();
                        self.session = SessionState::loading();
                        self.emit(CoordinatorEvent::StateChanged(self.session.clone()));
                        if self.apply(CoordinatorInput::SessionLost) {
                            self.redirect_if_protected();
                            self.drive(Step::CheckBackend).await;
                        }
                    }
                    CoordinatorPhase::Init => {
                        info!(?signal, "session lost before it was checked");
                        self.stop_heartbeat();
                        let error = self.surfaced_error.take();
                        match self.settle_unauthenticated(CoordinatorInput::SessionLost, error) {
                            Ok(next) => self.follow(next).await,
                            Err(e) => warn!(error = %e, "coordinator step failed"),
                        }
                    }
                    CoordinatorPhase::Unauthenticated => {
                        if let Some(error) = self.surfaced_error.take() {
                            self.session.error = Some(error);
                            self.emit(CoordinatorEvent::StateChanged(self.session.clone()));
                            self.publish();
                        }
                        self.redirect_if_protected();
                    }
                    _ => debug!(?signal, phase = ?phase, "cycle already running"),
                }
            }
        }
    }

    async fn on_sign_in(&mut self, tokens: TokenPair) -> AuthResult<()> {
        if tokens.access_token.is_empty() {
            return Err(AuthError::AuthenticationFailed(
                "empty access token".to_string(),
            ));
        }
        let phase = self.phase();
        if !matches!(
            phase,
            CoordinatorPhase::Init | CoordinatorPhase::Unauthenticated
        ) {
            return Err(AuthError::InvalidStateTransition(format!(
                "Cannot sign in while {phase:?}"
            )));
        }

        info!(coordinator_id = %self.id, "signing in with credentials");
        self.cancel_step_timer();
        self.stop_heartbeat();
        self.reset_cycle();
        self.credentials = Some(tokens.clone());
        self.tokens = Some((tokens, TokenOrigin::Credentials));
        self.session = SessionState::loading();
        self.transition(CoordinatorInput::CredentialsProvided)?;
        self.drive(Step::Transfer).await;
        Ok(())
    }

    async fn on_heartbeat(&mut self) {
        if !matches!(
            self.phase(),
            CoordinatorPhase::Init | CoordinatorPhase::Authenticated
        ) {
            return;
        }
        if self.backend_cookie(CookieNames::ACCESS_TOKEN).await.is_none() {
            debug!("backend access cookie is gone");
            self.on_signal(AuthSignal::BackendCookieRemoved).await;
        }
    }

    /// Clear every trace of the session. Failures are logged; the outcome
    /// is always UNAUTHENTICATED.
    async fn sign_out(&mut self, error: Option<ErrorKind>) {
        info!(coordinator_id = %self.id, "signing out");
        self.cancel_step_timer();
        self.stop_heartbeat();

        let epoch = self.ctx.transfer.lock().invalidate();
        debug!(epoch, "invalidated in-flight transfers");

        self.ctx.backend.logout().await;

        for domain in self.ctx.domains.known_domains() {
            if let Err(e) = self.ctx.transfer.clear_pair(domain).await {
                warn!(domain, error = %e, "failed to clear token cookies");
            }
        }
        let backend_domain = &self.ctx.domains.backend_domain;
        for name in CookieNames::INFORMATIONAL {
            if let Err(e) = self.ctx.cookies.remove(backend_domain, name).await {
                warn!(cookie = name, error = %e, "failed to clear user cookie");
            }
        }
        if let Err(e) = self.ctx.cache.clear() {
            warn!(error = %e, "failed to clear token cache");
        }

        self.reset_cycle();
        self.polling_suspended = true;
        self.surfaced_error = None;
        self.session = SessionState::unauthenticated(error);
        self.emit(CoordinatorEvent::StateChanged(self.session.clone()));
        self.apply(CoordinatorInput::SignOutRequested);
        self.redirect_if_protected();
    }

    // ---- cycle steps ----

    async fn start_cycle(&mut self) {
        info!(coordinator_id = %self.id, route = ?self.route, "starting auth cycle");
        self.stop_heartbeat();
        self.reset_cycle();
        if self.apply(CoordinatorInput::Mount) {
            self.drive(Step::CheckBackend).await;
        }
    }

    async fn drive(&mut self, step: Step) {
        let mut step = step;
        loop {
            let next = match step {
                Step::CheckBackend => self.check_backend().await,
                Step::CheckExternal => self.check_external().await,
                Step::Transfer => self.transfer().await,
                Step::Verify => self.verify().await,
                Step::Retry => self
                    .transition(CoordinatorInput::RetryAfterBackoff)
                    .map(|_| Next::Now(Step::CheckExternal)),
                Step::PollExternal => {
                    self.external_polls += 1;
                    debug!(poll = self.external_polls, "polling external source");
                    self.transition(CoordinatorInput::PollExternal)
                        .map(|_| Next::Now(Step::CheckExternal))
                }
            };

            match next {
                Ok(Next::Now(following)) => step = following,
                Ok(Next::After(delay, following)) => {
                    self.schedule(delay, following);
                    return;
                }
                Ok(Next::Idle) => return,
                Err(e) => {
                    warn!(error = %e, ?step, "coordinator step failed");
                    return;
                }
            }
        }
    }

    async fn follow(&mut self, next: Next) {
        match next {
            Next::Now(step) => self.drive(step).await,
            Next::After(delay, step) => self.schedule(delay, step),
            Next::Idle => {}
        }
    }

    async fn check_backend(&mut self) -> AuthResult<Next> {
        if self.backend_cookie(CookieNames::ACCESS_TOKEN).await.is_none() {
            debug!("no backend access cookie");
            self.transition(CoordinatorInput::BackendMissing)?;
            return Ok(Next::Now(Step::CheckExternal));
        }

        match self.ctx.backend.status().await {
            Ok(status) if status.is_authenticated => {
                self.authenticate(CoordinatorInput::BackendVerified, status.user)?;
                Ok(Next::Idle)
            }
            Ok(_) => {
                info!("backend rejected the access cookie");
                self.transition(CoordinatorInput::BackendRejected)?;
                Ok(Next::Now(Step::CheckExternal))
            }
            Err(e) => {
                warn!(error = %e, "backend status check failed");
                self.transition(CoordinatorInput::BackendRejected)?;
                Ok(Next::Now(Step::CheckExternal))
            }
        }
    }

    async fn check_external(&mut self) -> AuthResult<Next> {
        if let Some(tokens) = self.credentials.clone() {
            self.tokens = Some((tokens, TokenOrigin::Credentials));
            self.transition(CoordinatorInput::ExternalTokensFound)?;
            return Ok(Next::Now(Step::Transfer));
        }

        if let Some((tokens, origin)) = self.ctx.external.discover().await {
            info!(?origin, "found tokens from the auth site");
            self.tokens = Some((tokens, origin));
            self.transition(CoordinatorInput::ExternalTokensFound)?;
            return Ok(Next::Now(Step::Transfer));
        }

        if let Some(refresh_token) = self.backend_cookie(CookieNames::REFRESH_TOKEN).await {
            match self.ctx.backend.refresh(&refresh_token).await {
                Ok(tokens) => {
                    info!("recovered session from the backend refresh cookie");
                    self.tokens = Some((tokens, TokenOrigin::BackendRefresh));
                    self.transition(CoordinatorInput::ExternalTokensFound)?;
                    return Ok(Next::Now(Step::Transfer));
                }
                Err(e) if e.is_terminal() => {
                    warn!(error = %e, "refresh token rejected, signing out");
                    self.sign_out(Some(e.kind())).await;
                    return Ok(Next::Idle);
                }
                Err(e) => warn!(error = %e, "refresh from backend cookie failed"),
            }
        }

        // Background polls keep whatever error the UI is already showing.
        let shown = self.session.error.filter(|_| self.external_polls > 0);
        let error = self.surfaced_error.take().or(shown);
        self.settle_unauthenticated(CoordinatorInput::NoExternalTokens, error)
    }

    async fn transfer(&mut self) -> AuthResult<Next> {
        let Some((tokens, origin)) = self.tokens.clone() else {
            warn!("nothing to transfer");
            self.transition(CoordinatorInput::TransferFailed)?;
            return self.after_failure();
        };

        match self.ctx.transfer.transfer(&tokens).await {
            Ok(TransferOutcome::Written) => {
                if origin == TokenOrigin::Credentials {
                    if let Err(e) = self.ctx.backend.login(&tokens).await {
                        warn!(error = %e, "backend login failed, verifying anyway");
                    }
                }
                self.verify = VerifyProgress::default();
                self.transition(CoordinatorInput::CookiesWritten)?;
                Ok(Next::Now(Step::Verify))
            }
            Ok(TransferOutcome::AlreadyInProgress) => {
                self.verify = VerifyProgress::default();
                self.transition(CoordinatorInput::TransferSkipped)?;
                Ok(Next::Now(Step::Verify))
            }
            Ok(TransferOutcome::Superseded) => {
                info!("transfer voided by a sign-out");
                self.reset_cycle();
                self.polling_suspended = true;
                self.settle_unauthenticated(CoordinatorInput::SignOutRequested, None)
            }
            Err(e) => {
                warn!(error = %e, "cookie transfer failed");
                self.last_error = Some(e.kind());
                self.transition(CoordinatorInput::TransferFailed)?;
                self.after_failure()
            }
        }
    }

    async fn verify(&mut self) -> AuthResult<Next> {
        let cookie_poll = self.options.timing.cookie_poll.clone();
        let status_retry = self.options.timing.status_retry.clone();

        if !self.verify.cookie_found {
            if self.backend_cookie(CookieNames::ACCESS_TOKEN).await.is_some() {
                self.verify.cookie_found = true;
            } else {
                self.verify.cookie_attempts += 1;
                let attempts = self.verify.cookie_attempts;
                if attempts >= cookie_poll.max_attempts {
                    return self.verification_exhausted(attempts);
                }
                debug!(attempt = attempts, "backend cookie not visible yet");
                return Ok(Next::After(
                    cookie_poll.delay_for_attempt(attempts - 1),
                    Step::Verify,
                ));
            }
        }

        match self.ctx.backend.status().await {
            Ok(status) if status.is_authenticated => {
                self.ctx.external.clear_external_cookies().await;
                if let Some((tokens, _)) = &self.tokens {
                    if let Err(e) = self
                        .ctx
                        .cache
                        .store(&tokens.access_token, tokens.refresh_token.as_deref())
                    {
                        warn!(error = %e, "failed to cache tokens");
                    }
                }
                self.authenticate(CoordinatorInput::StatusVerified, status.user)?;
                return Ok(Next::Idle);
            }
            Ok(_) => debug!("backend does not accept the session yet"),
            Err(e) => {
                warn!(error = %e, "status check during verification failed");
                self.last_error = Some(e.kind());
            }
        }

        self.verify.status_attempts += 1;
        let attempts = self.verify.status_attempts;
        if attempts >= status_retry.max_attempts {
            return self.verification_exhausted(attempts);
        }
        Ok(Next::After(
            status_retry.delay_for_attempt(attempts - 1),
            Step::Verify,
        ))
    }

    fn verification_exhausted(&mut self, attempts: u32) -> AuthResult<Next> {
        let error = AuthError::VerificationTimeout { attempts };
        warn!(error = %error, "verification gave up");
        self.last_error = Some(error.kind());
        self.transition(CoordinatorInput::VerificationExhausted)?;
        self.after_failure()
    }

    /// In FAILED: back off and retry, or give up.
    fn after_failure(&mut self) -> AuthResult<Next> {
        self.failures += 1;
        let retry = &self.options.timing.cycle_retry;
        if self.failures >= retry.max_attempts {
            warn!(failures = self.failures, "auth cycle failed repeatedly, giving up");
            let error = self.last_error.take().or(Some(ErrorKind::VerificationTimeout));
            self.reset_cycle();
            self.polling_suspended = true;
            return self.settle_unauthenticated(CoordinatorInput::RetriesExhausted, error);
        }

        let delay = retry.delay_for_attempt(self.failures - 1);
        debug!(
            failures = self.failures,
            delay_ms = delay.as_millis() as u64,
            "retrying auth cycle after backoff"
        );
        Ok(Next::After(delay, Step::Retry))
    }

    fn authenticate(&mut self, input: CoordinatorInput, user: Option<User>) -> AuthResult<()> {
        self.session = SessionState::authenticated(user);
        self.reset_cycle();
        self.transition(input)?;
        info!(
            coordinator_id = %self.id,
            user_id = ?self.session.user.as_ref().map(|u| u.id.as_str()),
            "authenticated"
        );
        self.emit(CoordinatorEvent::StateChanged(self.session.clone()));
        self.start_heartbeat();
        Ok(())
    }

    /// Enter UNAUTHENTICATED and decide whether to keep polling.
    fn settle_unauthenticated(
        &mut self,
        input: CoordinatorInput,
        error: Option<ErrorKind>,
    ) -> AuthResult<Next> {
        self.session = SessionState::unauthenticated(error);
        self.transition(input)?;
        self.emit(CoordinatorEvent::StateChanged(self.session.clone()));
        self.redirect_if_protected();

        let timing = &self.options.timing;
        if self.polling_suspended || self.external_polls >= timing.max_external_polls {
            debug!(polls = self.external_polls, "external polling stopped");
            return Ok(Next::Idle);
        }
        Ok(Next::After(
            timing.external_poll_interval(),
            Step::PollExternal,
        ))
    }

    // ---- state plumbing ----

    fn phase(&self) -> CoordinatorPhase {
        CoordinatorPhase::from(self.machine.state())
    }

    /// Transition the FSM and publish the new snapshot.
    fn transition(&mut self, input: CoordinatorInput) -> AuthResult<CoordinatorPhase> {
        let old_phase = self.phase();
        self.machine.consume(&input).map_err(|_| {
            AuthError::InvalidStateTransition(format!(
                "Cannot apply {:?} in state {:?}",
                input,
                self.machine.state()
            ))
        })?;

        let new_phase = self.phase();
        if old_phase != new_phase {
            debug!(
                coordinator_id = %self.id,
                old_state = ?old_phase,
                new_state = ?new_phase,
                "Coordinator state transition"
            );
        }
        self.publish();
        Ok(new_phase)
    }

    /// `transition` for triggers whose failure only needs logging.
    fn apply(&mut self, input: CoordinatorInput) -> bool {
        match self.transition(input) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "ignoring trigger");
                false
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(CoordinatorSnapshot {
            phase: self.phase(),
            session: self.session.clone(),
        });
    }

    fn emit(&self, event: CoordinatorEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn set_route(&mut self, route: String) {
        if self.route.as_deref() != Some(route.as_str()) {
            self.redirected = false;
        }
        self.route = Some(route);
    }

    fn on_landing_route(&self) -> bool {
        self.route.as_deref() == Some(self.options.landing_route.as_str())
    }

    fn redirect_if_protected(&mut self) {
        let Some(route) = self.route.as_deref() else {
            return;
        };
        if route == self.options.landing_route || self.redirected {
            return;
        }
        info!(route, "redirecting to the landing route");
        self.redirected = true;
        self.emit(CoordinatorEvent::RedirectToLanding);
    }

    fn reset_cycle(&mut self) {
        self.tokens = None;
        self.credentials = None;
        self.verify = VerifyProgress::default();
        self.failures = 0;
        self.external_polls = 0;
        self.polling_suspended = false;
        self.last_error = None;
    }

    async fn backend_cookie(&self, name: &str) -> Option<String> {
        let domain = &self.ctx.domains.backend_domain;
        match self.ctx.cookies.get(domain, name).await {
            Ok(cookie) => cookie.map(|c| c.value).filter(|v| !v.is_empty()),
            Err(e) => {
                warn!(cookie = name, error = %e, "failed to read backend cookie");
                None
            }
        }
    }

    // ---- timers ----

    fn schedule(&mut self, delay: Duration, step: Step) {
        self.cancel_step_timer();
        let generation = self.generation;
        let commands = self.commands.clone();
        self.step_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Timer { generation, step }).await;
            }
        }));
    }

    fn cancel_step_timer(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.step_timer.take() {
            timer.abort();
        }
    }

    fn start_heartbeat(&mut self) {
        if self.heartbeat.is_some() {
            return;
        }
        let period = self
            .options
            .timing
            .session_check_interval()
            .max(Duration::from_millis(1));
        let commands = self.commands.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(commands) = commands.upgrade() else {
                    break;
                };
                if commands.send(Command::Heartbeat).await.is_err() {
                    break;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}
