//! One match session: a live push channel when it can be opened, a
//! snapshot-seeded degraded view when it cannot.

mod handlers;

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthError, StaticToken, TokenSource};
use crate::commands::CommandDispatcher;
use crate::config::ClientConfig;
use crate::connection::{
    ConnectError, ConnectionConfig, ConnectionManager, ConnectionState, ReconnectPolicy,
};
use crate::events::EventLog;
use crate::fallback::{FallbackError, FallbackLoader, MatchApi, ReqwestMatchApi};
use crate::model::{MatchEvent, MatchId, MatchInfo, MatchState};
use crate::normalize::{MatchSnapshot, Normalizer};
use crate::reconcile::StateReconciler;
use crate::transport::{HubEndpoint, HubTransport, WebSocketTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    /// Driven by the push channel; reconnect windows stay in this phase.
    Live,
    /// Seeded from a snapshot; no pushes will arrive.
    Degraded,
    Finished,
    Closed,
    /// Neither the push channel nor the snapshot fetch worked.
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Finished | SessionPhase::Closed | SessionPhase::Failed
        )
    }

    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        match (self, next) {
            (Connecting, Live | Degraded | Closed | Failed) => true,
            (Live | Degraded, Finished | Closed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("push channel unavailable ({connect}) and snapshot fetch failed: {fallback}")]
    Unavailable {
        connect: ConnectError,
        #[source]
        fallback: FallbackError,
    },
    #[error(transparent)]
    Fallback(#[from] FallbackError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("session was closed")]
    Closed,
    #[error("only available on a degraded session")]
    NotDegraded,
}

/// Why a session stopped producing updates. See [`MatchSession::settled`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    /// Finished, closed or failed.
    Phase(SessionPhase),
    /// Seeded from a snapshot; nothing is pushed to a degraded session.
    Snapshot,
    /// The push channel gave up reconnecting.
    Offline { reason: String },
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn HubTransport>,
    pub api: Arc<dyn MatchApi>,
    pub tokens: Arc<dyn TokenSource>,
    pub hub_url: Url,
    pub normalizer: Normalizer,
    pub invoke_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl SessionDeps {
    pub fn new(
        transport: Arc<dyn HubTransport>,
        api: Arc<dyn MatchApi>,
        tokens: Arc<dyn TokenSource>,
        hub_url: Url,
    ) -> Self {
        Self {
            transport,
            api,
            tokens,
            hub_url,
            normalizer: Normalizer::default(),
            invoke_timeout: crate::config::DEFAULT_INVOKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// WebSocket hub plus the reqwest-backed match api.
    pub fn from_config(config: &ClientConfig) -> Result<Self, SessionError> {
        let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::from(config.token.clone()));
        let api = ReqwestMatchApi::new(config.api_url.clone(), tokens.clone())?;
        let mut deps = Self::new(
            Arc::new(WebSocketTransport::default()),
            Arc::new(api),
            tokens,
            config.hub_url.clone(),
        );
        deps.normalizer = Normalizer::new(config.ticks_per_minute);
        deps.invoke_timeout = config.invoke_timeout;
        Ok(deps)
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    fn connection_config(&self, endpoint: HubEndpoint) -> ConnectionConfig {
        ConnectionConfig::new(endpoint)
            .with_invoke_timeout(self.invoke_timeout)
            .with_reconnect(self.reconnect.clone())
    }
}

/// Fires the cancellation a pending [`MatchSession::open_until`] races against.
#[derive(Debug)]
pub struct SessionCloser(watch::Sender<bool>);

impl SessionCloser {
    pub fn close(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CloseSignal(Option<watch::Receiver<bool>>);

impl CloseSignal {
    pub fn pair() -> (SessionCloser, CloseSignal) {
        let (tx, rx) = watch::channel(false);
        (SessionCloser(tx), CloseSignal(Some(rx)))
    }

    pub fn never() -> Self {
        CloseSignal(None)
    }

    /// Resolves once `close` was called. A dropped closer never fires.
    async fn closed(&mut self) {
        match self.0.as_mut() {
            Some(rx) => {
                if rx.wait_for(|closed| *closed).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

pub enum SessionMode {
    Live {
        connection: Arc<ConnectionManager>,
        commands: CommandDispatcher,
    },
    Degraded {
        api: Arc<dyn MatchApi>,
    },
}

/// Sinks shared with the push handlers.
#[derive(Clone)]
pub(crate) struct Sinks {
    pub(crate) match_id: MatchId,
    pub(crate) reconciler: Arc<StateReconciler>,
    pub(crate) events: Arc<Mutex<EventLog>>,
    pub(crate) phase: Arc<watch::Sender<SessionPhase>>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) last_error: Arc<Mutex<Option<String>>>,
}

impl Sinks {
    fn new(match_id: MatchId) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Connecting);
        Self {
            match_id,
            reconciler: Arc::new(StateReconciler::new()),
            events: Arc::new(Mutex::new(EventLog::new())),
            phase: Arc::new(phase),
            closed: Arc::new(AtomicBool::new(false)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn advance(&self, next: SessionPhase) -> bool {
        self.phase.send_if_modified(|phase| {
            if phase.can_transition_to(next) {
                *phase = next;
                true
            } else {
                false
            }
        })
    }

    /// Moves a live or degraded session to `Finished` once the reconciled
    /// status says so.
    pub(crate) fn finish_if_done(&self) {
        if self.reconciler.status().is_finished() && self.advance(SessionPhase::Finished) {
            info!(
                target = "matchday::session",
                match_id = %self.match_id,
                score = %self.reconciler.snapshot().score_line(),
                "match finished"
            );
        }
    }
}

pub struct MatchSession {
    id: Uuid,
    sinks: Sinks,
    mode: SessionMode,
    loader: FallbackLoader,
}

impl MatchSession {
    pub async fn open(deps: SessionDeps, match_id: MatchId) -> Result<Self, SessionError> {
        Self::open_until(deps, match_id, CloseSignal::never()).await
    }

    /// Opens the push channel, falling back to a snapshot when it cannot be
    /// established. Firing `signal` cancels whichever step is in flight and
    /// releases everything acquired so far.
    pub async fn open_until(
        deps: SessionDeps,
        match_id: MatchId,
        mut signal: CloseSignal,
    ) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let sinks = Sinks::new(match_id.clone());
        let loader = FallbackLoader::new(deps.api.clone(), deps.normalizer);
        info!(
            target = "matchday::session",
            session = %id,
            match_id = %match_id,
            "opening match session"
        );

        let token = deps.tokens.bearer_token().await?;
        let endpoint = HubEndpoint::new(deps.hub_url.clone(), token);
        let connection = Arc::new(
            ConnectionManager::new(
                match_id.clone(),
                deps.transport.clone(),
                deps.connection_config(endpoint),
            )
            .with_token_source(deps.tokens.clone()),
        );
        handlers::register(&connection, &sinks, deps.normalizer);

        let connected = tokio::select! {
            result = connection.connect() => result,
            _ = signal.closed() => {
                connection.disconnect().await;
                sinks.closed.store(true, Ordering::SeqCst);
                sinks.advance(SessionPhase::Closed);
                return Err(SessionError::Closed);
            }
        };

        let connect_err = match connected {
            Ok(()) => {
                sinks.advance(SessionPhase::Live);
                sinks.finish_if_done();
                info!(
                    target = "matchday::session",
                    session = %id,
                    match_id = %match_id,
                    "session live"
                );
                let commands = CommandDispatcher::new(connection.clone());
                return Ok(Self {
                    id,
                    sinks,
                    mode: SessionMode::Live {
                        connection,
                        commands,
                    },
                    loader,
                });
            }
            Err(err) => err,
        };

        connection.disconnect().await;
        warn!(
            target = "matchday::session",
            session = %id,
            match_id = %match_id,
            error = %connect_err,
            "push channel unavailable; loading snapshot"
        );

        let loaded = tokio::select! {
            result = loader.load(&match_id, &sinks.reconciler, &sinks.events) => result,
            _ = signal.closed() => {
                sinks.closed.store(true, Ordering::SeqCst);
                sinks.advance(SessionPhase::Closed);
                return Err(SessionError::Closed);
            }
        };

        match loaded {
            Ok(_) => {
                sinks.advance(SessionPhase::Degraded);
                sinks.finish_if_done();
                Ok(Self {
                    id,
                    sinks,
                    mode: SessionMode::Degraded {
                        api: deps.api.clone(),
                    },
                    loader,
                })
            }
            Err(fallback) => {
                sinks.advance(SessionPhase::Failed);
                error!(
                    target = "matchday::session",
                    session = %id,
                    match_id = %match_id,
                    error = %fallback,
                    "match unavailable"
                );
                Err(SessionError::Unavailable {
                    connect: connect_err,
                    fallback,
                })
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn match_id(&self) -> &MatchId {
        &self.sinks.match_id
    }

    pub fn phase(&self) -> SessionPhase {
        *self.sinks.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.sinks.phase.subscribe()
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn is_live(&self) -> bool {
        matches!(self.mode, SessionMode::Live { .. })
    }

    /// Degraded sessions are always offline; live ones only once the
    /// reconnect schedule gave up.
    pub fn is_offline(&self) -> bool {
        match &self.mode {
            SessionMode::Live { connection, .. } => connection.is_offline(),
            SessionMode::Degraded { .. } => true,
        }
    }

    pub fn connection_state(&self) -> Option<ConnectionState> {
        match &self.mode {
            SessionMode::Live { connection, .. } => Some(connection.state()),
            SessionMode::Degraded { .. } => None,
        }
    }

    /// Resolves once no further pushes will arrive: the phase is terminal,
    /// the session is degraded, or the live channel went offline.
    pub async fn settled(&self) -> Settled {
        let mut phases = self.subscribe_phase();
        let phase = *phases.borrow();
        if phase.is_terminal() {
            return Settled::Phase(phase);
        }
        let SessionMode::Live { connection, .. } = &self.mode else {
            return Settled::Snapshot;
        };
        let mut states = connection.subscribe_state();
        tokio::select! {
            phase = phases.wait_for(|phase| phase.is_terminal()) => match phase {
                Ok(phase) => Settled::Phase(*phase),
                Err(_) => Settled::Phase(SessionPhase::Closed),
            },
            state = states.wait_for(ConnectionState::is_offline) => match state {
                Ok(state) => Settled::Offline {
                    reason: match &*state {
                        ConnectionState::Failed { reason } => reason.clone(),
                        other => other.label().to_string(),
                    },
                },
                Err(_) => Settled::Phase(SessionPhase::Closed),
            },
        }
    }

    /// Push-channel state changes; `None` for a degraded session.
    pub fn subscribe_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        match &self.mode {
            SessionMode::Live { connection, .. } => Some(connection.subscribe_state()),
            SessionMode::Degraded { .. } => None,
        }
    }

    pub fn commands(&self) -> Option<&CommandDispatcher> {
        match &self.mode {
            SessionMode::Live { commands, .. } => Some(commands),
            SessionMode::Degraded { .. } => None,
        }
    }

    pub fn state(&self) -> MatchState {
        self.sinks.reconciler.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MatchState> {
        self.sinks.reconciler.subscribe()
    }

    pub fn info(&self) -> Option<MatchInfo> {
        self.sinks.reconciler.info()
    }

    pub fn events(&self) -> Vec<MatchEvent> {
        self.sinks.events.lock().to_vec()
    }

    pub fn with_events<R>(&self, f: impl FnOnce(&EventLog) -> R) -> R {
        f(&self.sinks.events.lock())
    }

    /// Last `Error` push from the hub.
    pub fn last_error(&self) -> Option<String> {
        self.sinks.last_error.lock().clone()
    }

    /// User-triggered re-fetch for a degraded session.
    pub async fn refresh(&self) -> Result<MatchSnapshot, SessionError> {
        self.ensure_degraded()?;
        let snapshot = self
            .loader
            .load(&self.sinks.match_id, &self.sinks.reconciler, &self.sinks.events)
            .await?;
        self.sinks.finish_if_done();
        Ok(snapshot)
    }

    /// Asks the match service to play out the rest of the match and seeds
    /// the result.
    pub async fn simulate_remainder(&self) -> Result<MatchSnapshot, SessionError> {
        self.ensure_degraded()?;
        let snapshot = self
            .loader
            .simulate_remainder(
                &self.sinks.match_id,
                &self.sinks.reconciler,
                &self.sinks.events,
            )
            .await?;
        self.sinks.finish_if_done();
        Ok(snapshot)
    }

    fn ensure_degraded(&self) -> Result<(), SessionError> {
        if self.sinks.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        match self.mode {
            SessionMode::Degraded { .. } => Ok(()),
            SessionMode::Live { .. } => Err(SessionError::NotDegraded),
        }
    }

    /// Tears the session down. Handlers are gone and the channel released
    /// when this returns; later calls are no-ops.
    pub async fn close(&self) {
        if self.sinks.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let SessionMode::Live { connection, .. } = &self.mode {
            connection.disconnect().await;
        }
        self.sinks.advance(SessionPhase::Closed);
        info!(
            target = "matchday::session",
            session = %self.id,
            match_id = %self.sinks.match_id,
            phase = ?self.phase(),
            "session closed"
        );
    }
}

impl Drop for MatchSession {
    fn drop(&mut self) {
        self.sinks.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_machine_allows_only_documented_moves() {
        use SessionPhase::*;
        assert!(Connecting.can_transition_to(Live));
        assert!(Connecting.can_transition_to(Degraded));
        assert!(Live.can_transition_to(Finished));
        assert!(Degraded.can_transition_to(Closed));
        assert!(!Degraded.can_transition_to(Live));
        assert!(!Live.can_transition_to(Degraded));
        assert!(!Connecting.can_transition_to(Finished));
        for terminal in [Finished, Closed, Failed] {
            assert!(terminal.is_terminal());
            for next in [Connecting, Live, Degraded, Finished, Closed, Failed] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[tokio::test]
    async fn close_signal_fires_once_closed() {
        let (closer, mut signal) = CloseSignal::pair();
        let waiter = tokio::spawn(async move { signal.closed().await });
        closer.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("signal fired")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_closer_never_fires() {
        let (closer, mut signal) = CloseSignal::pair();
        drop(closer);
        let fired = tokio::time::timeout(Duration::from_millis(50), signal.closed()).await;
        assert!(fired.is_err());
    }
}
