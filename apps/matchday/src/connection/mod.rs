//! Push-channel lifecycle for one match.
//!
//! A [`ConnectionManager`] owns at most one channel. `connect` opens it,
//! performs the hub handshake, and joins the match room; a spawned driver
//! task then owns the link: it dispatches server pushes to registered
//! handlers, resolves pending invocations, and runs the reconnect schedule
//! when the link drops or goes silent. Per-attempt reconnect failures stay
//! inside the driver; callers only see the state moving to `Failed` once the
//! schedule is exhausted.

pub mod backoff;

pub use backoff::ReconnectPolicy;

use hub_proto::{HandshakeRequest, HandshakeResponse, HubMessage};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::auth::{AuthError, TokenSource};
use crate::model::MatchId;
use crate::telemetry;
use crate::transport::{HubEndpoint, HubLink, HubTransport, TransportError};

pub const JOIN_METHOD: &str = "JoinMatch";
pub const LEAVE_METHOD: &str = "LeaveMatch";

const MIN_KEEPALIVE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, `connect` not called yet.
    Idle,
    Connecting,
    Open,
    Reconnecting { attempt: usize },
    Closed,
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Sustained loss signalled by the transport. Reconnect windows are not
    /// offline.
    pub fn is_offline(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("hub rejected handshake: {0}")]
    Handshake(String),
    #[error("hub handshake timed out")]
    HandshakeTimeout,
    #[error("joining match room failed: {0}")]
    Join(InvokeError),
    #[error("connection was already started")]
    AlreadyStarted,
    #[error("connection has been disconnected")]
    Disposed,
    #[error("bearer token unavailable: {0}")]
    Auth(#[from] AuthError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("not connected")]
    NotConnected,
    #[error("rejected by hub: {0}")]
    Rejected(String),
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("connection lost before acknowledgement")]
    ConnectionLost,
    #[error("unable to encode invocation: {0}")]
    Encode(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: HubEndpoint,
    pub handshake_timeout: Duration,
    pub invoke_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Ping cadence while the link is open.
    pub keepalive_interval: Duration,
    /// Silence after which an open link is treated as lost.
    pub server_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    pub fn new(endpoint: HubEndpoint) -> Self {
        Self {
            endpoint,
            handshake_timeout: Duration::from_secs(5),
            invoke_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, server_timeout: Duration) -> Self {
        self.keepalive_interval = interval;
        self.server_timeout = server_timeout;
        self
    }
}

pub type MessageHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;
type HandlerMap = Arc<RwLock<HashMap<String, Vec<MessageHandler>>>>;
type Reply = oneshot::Sender<Result<Option<Value>, InvokeError>>;

enum Outbound {
    Invoke {
        id: String,
        method: String,
        arguments: Vec<Value>,
        reply: Reply,
    },
    Shutdown,
}

pub struct ConnectionManager {
    id: Uuid,
    match_id: MatchId,
    config: ConnectionConfig,
    transport: Arc<dyn HubTransport>,
    tokens: Option<Arc<dyn TokenSource>>,
    handlers: HandlerMap,
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    next_invocation: Arc<AtomicU64>,
    disposed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        match_id: MatchId,
        transport: Arc<dyn HubTransport>,
        config: ConnectionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            id: Uuid::new_v4(),
            match_id,
            config,
            transport,
            tokens: None,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(state),
            outbound: Mutex::new(None),
            driver: Mutex::new(None),
            next_invocation: Arc::new(AtomicU64::new(1)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Re-reads the bearer token before every reconnect so a rotated token
    /// replaces the one the channel was first opened with.
    pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn match_id(&self) -> &MatchId {
        &self.match_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_offline(&self) -> bool {
        self.state.borrow().is_offline()
    }

    /// Opens the channel and joins the match room. Resolves once the join is
    /// acknowledged; any failure leaves the manager `Failed` with nothing
    /// left running.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ConnectError::Disposed);
        }
        if self.driver.lock().is_some() {
            return Err(ConnectError::AlreadyStarted);
        }
        self.state.send_replace(ConnectionState::Connecting);
        info!(
            target = "matchday::connection",
            connection = %self.id,
            match_id = %self.match_id,
            url = %self.config.endpoint.url,
            "opening push channel"
        );

        let link = match open_channel(
            self.transport.as_ref(),
            &self.config.endpoint,
            self.config.handshake_timeout,
        )
        .await
        {
            Ok(link) => link,
            Err(err) => {
                self.fail(&err.to_string());
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            connection: self.id,
            match_id: self.match_id.clone(),
            link,
            transport: self.transport.clone(),
            tokens: self.tokens.clone(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            state: self.state.clone(),
            next_invocation: self.next_invocation.clone(),
            pending: HashMap::new(),
        };
        *self.outbound.lock() = Some(tx);
        *self.driver.lock() = Some(tokio::spawn(driver.run(rx)));

        if self.disposed.load(Ordering::SeqCst) {
            self.stop_driver().await;
            return Err(ConnectError::Disposed);
        }

        if let Err(err) = self.call(JOIN_METHOD, vec![json!(self.match_id.as_str())]).await {
            warn!(
                target = "matchday::connection",
                connection = %self.id,
                match_id = %self.match_id,
                error = %err,
                "join failed"
            );
            self.stop_driver().await;
            self.fail(&err.to_string());
            return Err(ConnectError::Join(err));
        }

        // The driver flips the state to Failed if the link died while the
        // join was in flight; only promote from Connecting.
        let opened = self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Connecting) {
                *state = ConnectionState::Open;
                true
            } else {
                false
            }
        });
        if !opened {
            self.stop_driver().await;
            return Err(ConnectError::Transport(TransportError::Closed));
        }

        info!(
            target = "matchday::connection",
            connection = %self.id,
            match_id = %self.match_id,
            "joined match room"
        );
        Ok(())
    }

    /// Registers a handler for every push named `event` (case-insensitive).
    /// Registrations accumulate; all of them run for each message.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.handlers
            .write()
            .entry(event.to_ascii_lowercase())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .get(&event.to_ascii_lowercase())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Sends a request and waits for the hub's acknowledgement. Fails
    /// immediately with `NotConnected` unless the channel is open.
    pub async fn invoke(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, InvokeError> {
        if !self.state.borrow().is_open() {
            return Err(InvokeError::NotConnected);
        }
        self.call(method, arguments).await
    }

    async fn call(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, InvokeError> {
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(InvokeError::NotConnected)?;
        let id = self.next_invocation.fetch_add(1, Ordering::Relaxed).to_string();
        let (reply, response) = oneshot::channel();
        sender
            .send(Outbound::Invoke {
                id,
                method: method.to_string(),
                arguments,
                reply,
            })
            .map_err(|_| InvokeError::NotConnected)?;

        match tokio::time::timeout(self.config.invoke_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InvokeError::ConnectionLost),
            Err(_) => Err(InvokeError::Timeout(self.config.invoke_timeout)),
        }
    }

    /// Tears the channel down. Handlers are unregistered and the driver has
    /// stopped by the time this returns. Safe to call repeatedly and on a
    /// manager that never connected.
    pub async fn disconnect(&self) {
        let first = !self.disposed.swap(true, Ordering::SeqCst);
        self.handlers.write().clear();
        self.stop_driver().await;
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Closed) {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if first {
            debug!(
                target = "matchday::connection",
                connection = %self.id,
                match_id = %self.match_id,
                "push channel closed"
            );
        }
    }

    async fn stop_driver(&self) {
        let sender = self.outbound.lock().take();
        let handle = self.driver.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(Outbound::Shutdown);
        }
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!(
                    target = "matchday::connection",
                    connection = %self.id,
                    "driver did not stop in time; aborting"
                );
                handle.abort();
            }
        }
    }

    fn fail(&self, reason: &str) {
        self.state.send_replace(ConnectionState::Failed {
            reason: reason.to_string(),
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.get_mut().take() {
            handle.abort();
        }
    }
}

async fn open_channel(
    transport: &dyn HubTransport,
    endpoint: &HubEndpoint,
    handshake_timeout: Duration,
) -> Result<Box<dyn HubLink>, ConnectError> {
    let mut link = transport.open(endpoint).await?;
    let request = HandshakeRequest::default()
        .encode()
        .map_err(|err| ConnectError::Handshake(err.to_string()))?;
    link.send(request).await?;

    let frame = match tokio::time::timeout(handshake_timeout, link.recv()).await {
        Err(_) => {
            link.close().await;
            return Err(ConnectError::HandshakeTimeout);
        }
        Ok(None) => return Err(ConnectError::Transport(TransportError::Closed)),
        Ok(Some(Err(err))) => return Err(ConnectError::Transport(err)),
        Ok(Some(Ok(frame))) => frame,
    };
    let response = HandshakeResponse::decode(&frame)
        .map_err(|err| ConnectError::Handshake(format!("malformed handshake response: {err}")))?;
    if let Some(reason) = response.error {
        link.close().await;
        return Err(ConnectError::Handshake(reason));
    }
    Ok(link)
}

enum LinkEnd {
    Lost(String),
    ClosedByServer {
        reason: Option<String>,
        allow_reconnect: bool,
    },
    Shutdown,
}

enum Reconnect {
    Restored(Box<dyn HubLink>),
    Exhausted(String),
    Shutdown,
}

struct Driver {
    connection: Uuid,
    match_id: MatchId,
    link: Box<dyn HubLink>,
    transport: Arc<dyn HubTransport>,
    tokens: Option<Arc<dyn TokenSource>>,
    config: ConnectionConfig,
    handlers: HandlerMap,
    state: Arc<watch::Sender<ConnectionState>>,
    next_invocation: Arc<AtomicU64>,
    pending: HashMap<String, Reply>,
}

impl Driver {
    async fn run(mut self, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            let end = self.pump(&mut outbound).await;
            self.fail_pending();

            let reason = match end {
                LinkEnd::Shutdown => return,
                LinkEnd::ClosedByServer {
                    reason,
                    allow_reconnect: false,
                } => {
                    let reason = reason.unwrap_or_else(|| "hub closed the channel".to_string());
                    self.go_offline(&reason);
                    return;
                }
                LinkEnd::ClosedByServer { reason, .. } => {
                    reason.unwrap_or_else(|| "hub requested reconnect".to_string())
                }
                LinkEnd::Lost(reason) => reason,
            };

            let established = self.state.borrow().is_open();
            if !established || !self.config.reconnect.is_enabled() {
                self.go_offline(&reason);
                return;
            }

            warn!(
                target = "matchday::connection",
                connection = %self.connection,
                match_id = %self.match_id,
                reason = %reason,
                "push channel dropped; reconnecting"
            );
            match self.reconnect(&mut outbound).await {
                Reconnect::Restored(link) => {
                    self.link = link;
                    self.state.send_replace(ConnectionState::Open);
                }
                Reconnect::Exhausted(last_error) => {
                    self.go_offline(&last_error);
                    return;
                }
                Reconnect::Shutdown => return,
            }
        }
    }

    async fn pump(&mut self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> LinkEnd {
        let every = self.config.keepalive_interval.max(MIN_KEEPALIVE);
        let server_timeout = self.config.server_timeout;
        let mut keepalive = tokio::time::interval_at(Instant::now() + every, every);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let silence = tokio::time::sleep(server_timeout);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                frame = self.link.recv() => match frame {
                    Some(Ok(text)) => {
                        silence.as_mut().reset(Instant::now() + server_timeout);
                        if let Some(end) = self.handle_frame(&text) {
                            return end;
                        }
                    }
                    Some(Err(err)) => return LinkEnd::Lost(err.to_string()),
                    None => return LinkEnd::Lost("channel closed by remote".to_string()),
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Invoke { id, method, arguments, reply }) => {
                        let sent = self.send_invocation(id, &method, arguments, reply).await;
                        if let Some(end) = sent {
                            return end;
                        }
                    }
                    Some(Outbound::Shutdown) | None => {
                        self.leave().await;
                        self.link.close().await;
                        return LinkEnd::Shutdown;
                    }
                },
                _ = keepalive.tick() => {
                    if let Err(err) = self.send_ping().await {
                        return LinkEnd::Lost(err.to_string());
                    }
                }
                _ = &mut silence => {
                    debug!(
                        target = "matchday::connection",
                        connection = %self.connection,
                        silent_ms = server_timeout.as_millis() as u64,
                        "no frames from hub"
                    );
                    self.link.close().await;
                    return LinkEnd::Lost("server timeout".to_string());
                }
            }
        }
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        match HubMessage::Ping.encode() {
            Ok(frame) => self.link.send(frame).await,
            Err(err) => {
                trace!(
                    target = "matchday::connection",
                    error = %err,
                    "unable to encode keepalive"
                );
                Ok(())
            }
        }
    }

    async fn send_invocation(
        &mut self,
        id: String,
        method: &str,
        arguments: Vec<Value>,
        reply: Reply,
    ) -> Option<LinkEnd> {
        let frame = match HubMessage::invocation(id.clone(), method, arguments).encode() {
            Ok(frame) => frame,
            Err(err) => {
                let _ = reply.send(Err(InvokeError::Encode(err.to_string())));
                return None;
            }
        };
        if telemetry::wire_tracing() {
            trace!(target = "matchday::wire", direction = "out", frame = %frame);
        }
        match self.link.send(frame).await {
            Ok(()) => {
                self.pending.retain(|_, waiting| !waiting.is_closed());
                self.pending.insert(id, reply);
                None
            }
            Err(err) => {
                let _ = reply.send(Err(InvokeError::ConnectionLost));
                Some(LinkEnd::Lost(err.to_string()))
            }
        }
    }

    fn handle_frame(&mut self, text: &str) -> Option<LinkEnd> {
        if telemetry::wire_tracing() {
            trace!(target = "matchday::wire", direction = "in", frame = %text);
        }
        let message = match HubMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(
                    target = "matchday::connection",
                    connection = %self.connection,
                    error = %err,
                    "ignoring undecodable hub frame"
                );
                return None;
            }
        };
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                self.dispatch(&target, &arguments);
                None
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                match self.pending.remove(&invocation_id) {
                    Some(reply) => {
                        let outcome = match error {
                            Some(reason) => Err(InvokeError::Rejected(reason)),
                            None => Ok(result),
                        };
                        let _ = reply.send(outcome);
                    }
                    None => trace!(
                        target = "matchday::connection",
                        invocation_id = %invocation_id,
                        "completion for unknown invocation"
                    ),
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => Some(LinkEnd::ClosedByServer {
                reason: error,
                allow_reconnect,
            }),
        }
    }

    fn dispatch(&self, target: &str, arguments: &[Value]) {
        let handlers: Vec<MessageHandler> = self
            .handlers
            .read()
            .get(&target.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!(
                target = "matchday::connection",
                push = %target,
                "no handler registered"
            );
            return;
        }
        for handler in handlers {
            handler(arguments);
        }
    }

    async fn leave(&mut self) {
        if !self.state.borrow().is_open() {
            return;
        }
        let frame = HubMessage::push(LEAVE_METHOD, vec![json!(self.match_id.as_str())]).encode();
        if let Ok(frame) = frame {
            let _ = self.link.send(frame).await;
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(InvokeError::ConnectionLost));
        }
    }

    fn go_offline(&self, reason: &str) {
        error!(
            target = "matchday::connection",
            connection = %self.connection,
            match_id = %self.match_id,
            reason = %reason,
            "push channel offline"
        );
        self.state.send_replace(ConnectionState::Failed {
            reason: reason.to_string(),
        });
    }

    async fn reconnect(&mut self, outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> Reconnect {
        let policy = self.config.reconnect.clone();
        let mut last_error = String::from("reconnect attempts exhausted");

        for attempt in 1..=policy.max_attempts() {
            let delay = policy.delay_for(attempt).unwrap_or_default();
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = outbound.recv() => match command {
                        Some(Outbound::Invoke { reply, .. }) => {
                            let _ = reply.send(Err(InvokeError::NotConnected));
                        }
                        Some(Outbound::Shutdown) | None => return Reconnect::Shutdown,
                    },
                }
            }

            match self.restore().await {
                Ok(link) => {
                    info!(
                        target = "matchday::connection",
                        connection = %self.connection,
                        match_id = %self.match_id,
                        attempt,
                        "push channel restored"
                    );
                    return Reconnect::Restored(link);
                }
                Err(err) => {
                    debug!(
                        target = "matchday::connection",
                        connection = %self.connection,
                        attempt,
                        error = %err,
                        "reconnect attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
        }
        Reconnect::Exhausted(last_error)
    }

    /// Opens a fresh link and re-joins the room on it. Pushes that arrive
    /// before the join acknowledgement are dispatched as usual.
    async fn restore(&mut self) -> Result<Box<dyn HubLink>, ConnectError> {
        if let Some(tokens) = &self.tokens {
            self.config.endpoint.bearer_token = tokens.bearer_token().await?;
        }
        let mut link = open_channel(
            self.transport.as_ref(),
            &self.config.endpoint,
            self.config.handshake_timeout,
        )
        .await?;

        let join_id = self
            .next_invocation
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        let frame = HubMessage::invocation(
            join_id.clone(),
            JOIN_METHOD,
            vec![json!(self.match_id.as_str())],
        )
        .encode()
        .map_err(|err| ConnectError::Join(InvokeError::Encode(err.to_string())))?;
        link.send(frame).await?;

        let deadline = tokio::time::Instant::now() + self.config.invoke_timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, link.recv()).await {
                Err(_) => {
                    link.close().await;
                    return Err(ConnectError::Join(InvokeError::Timeout(
                        self.config.invoke_timeout,
                    )));
                }
                Ok(None) => return Err(ConnectError::Transport(TransportError::Closed)),
                Ok(Some(Err(err))) => return Err(ConnectError::Transport(err)),
                Ok(Some(Ok(frame))) => frame,
            };
            match HubMessage::decode(&frame) {
                Ok(HubMessage::Completion {
                    invocation_id,
                    error,
                    ..
                }) if invocation_id == join_id => {
                    return match error {
                        Some(reason) => {
                            link.close().await;
                            Err(ConnectError::Join(InvokeError::Rejected(reason)))
                        }
                        None => Ok(link),
                    };
                }
                Ok(HubMessage::Invocation {
                    target, arguments, ..
                }) => self.dispatch(&target, &arguments),
                Ok(HubMessage::Close { error, .. }) => {
                    return Err(ConnectError::Transport(TransportError::Connect(
                        error.unwrap_or_else(|| "closed during rejoin".to_string()),
                    )));
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ClientCall;
    use crate::transport::{MockHub, MockPeer, MockTransport};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn endpoint() -> HubEndpoint {
        HubEndpoint::new(
            url::Url::parse("ws://mock/hubs/match").unwrap(),
            Some("bearer-1".into()),
        )
    }

    fn config(policy: ReconnectPolicy) -> ConnectionConfig {
        ConnectionConfig::new(endpoint())
            .with_invoke_timeout(Duration::from_millis(500))
            .with_handshake_timeout(Duration::from_millis(500))
            .with_reconnect(policy)
    }

    fn manager(transport: MockTransport, policy: ReconnectPolicy) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            MatchId::new("m-42"),
            Arc::new(transport),
            config(policy),
        ))
    }

    /// Hands out `token-1`, `token-2`, ... one per call.
    #[derive(Default)]
    struct RotatingToken {
        issued: AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for RotatingToken {
        async fn bearer_token(&self) -> Result<Option<String>, AuthError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Some(format!("token-{n}")))
        }
    }

    async fn connect_with_join(
        conn: &ConnectionManager,
        mut hub: MockHub,
    ) -> (MockHub, MockPeer, ClientCall) {
        let hub_side = tokio::spawn(async move {
            let mut peer = hub.next_peer().await.expect("peer");
            let join = peer.accept_join().await.expect("join");
            (hub, peer, join)
        });
        conn.connect().await.expect("connect");
        hub_side.await.expect("hub task")
    }

    async fn wait_for_state<F>(conn: &ConnectionManager, predicate: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = conn.subscribe_state();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("state change timed out")
            .expect("state sender alive");
        state.clone()
    }

    #[tokio::test]
    async fn connect_joins_room_with_bearer_token() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        assert_eq!(conn.state(), ConnectionState::Idle);

        let (hub, _peer, join) = connect_with_join(&conn, hub).await;
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(join.target, JOIN_METHOD);
        assert_eq!(join.arguments, vec![json!("m-42")]);
        assert_eq!(hub.tokens(), vec![Some("bearer-1".to_string())]);
    }

    #[tokio::test]
    async fn refused_transport_fails_connect() {
        let (transport, hub) = MockTransport::pair();
        hub.refuse_connections(true);
        let conn = manager(transport, ReconnectPolicy::default());
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::Transport(TransportError::Connect(_))));
        assert!(conn.is_offline());
        assert_eq!(hub.opens(), 1);
    }

    #[tokio::test]
    async fn rejected_handshake_fails_connect() {
        let (transport, mut hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        let hub_side = tokio::spawn(async move {
            let mut peer = hub.next_peer().await.expect("peer");
            peer.reject_handshake("unsupported protocol").await;
            peer
        });
        let err = conn.connect().await.unwrap_err();
        assert_eq!(err, ConnectError::Handshake("unsupported protocol".into()));
        drop(hub_side.await);
    }

    #[tokio::test]
    async fn rejected_join_fails_connect_and_stops_driver() {
        let (transport, mut hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::default());
        let hub_side = tokio::spawn(async move {
            let mut peer = hub.next_peer().await.expect("peer");
            peer.accept_handshake().await.expect("handshake");
            let join = peer.expect_call().await.expect("join call");
            peer.reject(&join, "match not found");
            let closed = peer.wait_closed().await;
            (hub, closed)
        });
        let err = conn.connect().await.unwrap_err();
        assert_eq!(
            err,
            ConnectError::Join(InvokeError::Rejected("match not found".into()))
        );
        let (hub, closed) = hub_side.await.unwrap();
        assert!(closed, "link must be released after a failed join");
        assert_eq!(hub.opens(), 1, "no reconnect for a session that never opened");
        assert!(conn.is_offline());
    }

    #[tokio::test]
    async fn every_registered_handler_runs() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        let hits = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let hits = hits.clone();
            conn.on("ReceiveMatchState", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        conn.on("receivematchstate", move |args| {
            let _ = tx.send(args.to_vec());
        });
        assert_eq!(conn.handler_count("RECEIVEMATCHSTATE"), 2);

        let (_hub, peer, _) = connect_with_join(&conn, hub).await;
        peer.push("ReceiveMatchState", json!({"tick": 10}));
        let args = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(args, vec![json!({"tick": 10})]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invoke_before_connect_is_not_connected() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        let err = conn.invoke("PauseMatch", vec![json!("m-42")]).await.unwrap_err();
        assert_eq!(err, InvokeError::NotConnected);
        assert_eq!(hub.opens(), 0);
    }

    #[tokio::test]
    async fn invoke_resolves_on_completion_and_rejection() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        let (_hub, mut peer, _) = connect_with_join(&conn, hub).await;

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.invoke("PauseMatch", vec![json!("m-42")]).await })
        };
        let call = peer.expect_call().await.expect("pause call");
        assert_eq!(call.target, "PauseMatch");
        peer.complete(&call, Some(json!({"ok": true})));
        assert_eq!(caller.await.unwrap(), Ok(Some(json!({"ok": true}))));

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.invoke("ResumeMatch", vec![json!("m-42")]).await })
        };
        let call = peer.expect_call().await.expect("resume call");
        peer.reject(&call, "match is not paused");
        assert_eq!(
            caller.await.unwrap(),
            Err(InvokeError::Rejected("match is not paused".into()))
        );
    }

    #[tokio::test]
    async fn unacknowledged_invoke_times_out() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        let (_hub, _peer, _) = connect_with_join(&conn, hub).await;
        let err = conn.invoke("PauseMatch", vec![]).await.unwrap_err();
        assert_eq!(err, InvokeError::Timeout(Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_safe_before_connect() {
        let (transport, _hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.connect().await.unwrap_err(), ConnectError::Disposed);
    }

    #[tokio::test]
    async fn disconnect_leaves_room_and_clears_handlers() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::default());
        conn.on("MatchPaused", |_| {});
        let (_hub, mut peer, _) = connect_with_join(&conn, hub).await;

        conn.disconnect().await;
        assert_eq!(conn.handler_count("MatchPaused"), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_offline());

        let leave = peer.expect_call().await.expect("leave call");
        assert_eq!(leave.target, LEAVE_METHOD);
        assert_eq!(leave.invocation_id, None);
        assert!(peer.wait_closed().await);

        conn.on("MatchPaused", |_| {});
        assert_eq!(conn.handler_count("MatchPaused"), 0);
    }

    #[tokio::test]
    async fn dropped_link_reconnects_and_rejoins() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(
            transport,
            ReconnectPolicy::fixed(vec![Duration::ZERO, Duration::ZERO]),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on("ReceiveMatchState", move |args| {
            let _ = tx.send(args.to_vec());
        });
        let (mut hub, mut peer, _) = connect_with_join(&conn, hub).await;

        peer.fail_link("connection reset");
        let state =
            wait_for_state(&conn, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert!(!state.is_offline());
        assert_eq!(
            conn.invoke("PauseMatch", vec![]).await,
            Err(InvokeError::NotConnected)
        );

        let mut restored = hub.next_peer().await.expect("second channel");
        let join = restored.accept_join().await.expect("rejoin");
        assert_eq!(join.arguments, vec![json!("m-42")]);
        wait_for_state(&conn, ConnectionState::is_open).await;

        restored.push("ReceiveMatchState", json!({"tick": 99}));
        let args = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(args[0]["tick"], 99);
        assert_eq!(hub.opens(), 2);
    }

    #[tokio::test]
    async fn reconnect_uses_a_fresh_bearer_token() {
        let (transport, hub) = MockTransport::pair();
        let conn = Arc::new(
            ConnectionManager::new(
                MatchId::new("m-42"),
                Arc::new(transport),
                config(ReconnectPolicy::fixed(vec![Duration::ZERO])),
            )
            .with_token_source(Arc::new(RotatingToken::default())),
        );
        let (mut hub, mut peer, _) = connect_with_join(&conn, hub).await;

        peer.fail_link("token expired");
        let mut restored = hub.next_peer().await.expect("second channel");
        restored.accept_join().await.expect("rejoin");
        wait_for_state(&conn, ConnectionState::is_open).await;

        assert_eq!(
            hub.tokens(),
            vec![Some("bearer-1".to_string()), Some("token-1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_hub_is_treated_as_lost() {
        let (transport, hub) = MockTransport::pair();
        let conn = Arc::new(ConnectionManager::new(
            MatchId::new("m-42"),
            Arc::new(transport),
            config(ReconnectPolicy::fixed(vec![Duration::from_secs(60)]))
                .with_keepalive(Duration::from_millis(100), Duration::from_millis(300)),
        ));
        let (hub, mut peer, _) = connect_with_join(&conn, hub).await;

        let state =
            wait_for_state(&conn, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });
        assert!(!conn.is_offline());
        assert_eq!(hub.opens(), 1);

        let mut pings = 0;
        while let Some(frame) = peer.recv_frame().await {
            if HubMessage::decode(&frame).unwrap() == HubMessage::Ping {
                pings += 1;
            }
        }
        assert!(pings >= 2, "expected keepalive pings, saw {pings}");
    }

    #[tokio::test]
    async fn in_flight_invoke_fails_when_link_drops() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::disabled());
        let (_hub, mut peer, _) = connect_with_join(&conn, hub).await;

        let caller = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.invoke("GiveSpeech", vec![json!({})]).await })
        };
        peer.expect_call().await.expect("speech call");
        peer.fail_link("gone");
        assert_eq!(caller.await.unwrap(), Err(InvokeError::ConnectionLost));
        let state = wait_for_state(&conn, ConnectionState::is_offline).await;
        assert!(matches!(state, ConnectionState::Failed { .. }));
    }

    #[tokio::test]
    async fn exhausted_reconnects_go_offline() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(
            transport,
            ReconnectPolicy::fixed(vec![Duration::ZERO, Duration::from_millis(10)]),
        );
        let (hub, mut peer, _) = connect_with_join(&conn, hub).await;
        hub.refuse_connections(true);
        peer.drop_link();

        wait_for_state(&conn, ConnectionState::is_offline).await;
        assert_eq!(hub.opens(), 3);
        assert!(conn.is_offline());
    }

    #[tokio::test]
    async fn server_close_without_reconnect_goes_offline() {
        let (transport, hub) = MockTransport::pair();
        let conn = manager(transport, ReconnectPolicy::default());
        let (hub, peer, _) = connect_with_join(&conn, hub).await;
        peer.send(&HubMessage::Close {
            error: Some("match archived".into()),
            allow_reconnect: false,
        });
        let state = wait_for_state(&conn, ConnectionState::is_offline).await;
        assert_eq!(
            state,
            ConnectionState::Failed {
                reason: "match archived".into()
            }
        );
        assert_eq!(hub.opens(), 1);
    }
}
