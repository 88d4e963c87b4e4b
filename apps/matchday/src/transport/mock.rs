//! In-memory push channel for tests and offline tooling.
//!
//! [`MockTransport`] is handed to the connection manager; the paired
//! [`MockHub`] plays the server: it can refuse connections, and every
//! accepted channel surfaces as a [`MockPeer`] that scripts the hub side.

use async_trait::async_trait;
use hub_proto::{FrameReader, HandshakeRequest, HandshakeResponse, HubMessage};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{HubEndpoint, HubLink, HubTransport, TransportError};

const PEER_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct MockState {
    refuse_all: bool,
    refuse_next: usize,
    opens: usize,
    tokens: Vec<Option<String>>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockState>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

#[derive(Debug, Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

pub struct MockHub {
    shared: Arc<Shared>,
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl MockTransport {
    pub fn pair() -> (MockTransport, MockHub) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(MockState::default()),
            peers: tx,
        });
        (
            MockTransport {
                shared: shared.clone(),
            },
            MockHub { shared, peers: rx },
        )
    }
}

#[async_trait]
impl HubTransport for MockTransport {
    async fn open(&self, endpoint: &HubEndpoint) -> Result<Box<dyn HubLink>, TransportError> {
        {
            let mut state = self.shared.state.lock();
            state.opens += 1;
            state.tokens.push(endpoint.bearer_token.clone());
            if state.refuse_all {
                return Err(TransportError::Connect("mock hub refusing connections".into()));
            }
            if state.refuse_next > 0 {
                state.refuse_next -= 1;
                return Err(TransportError::Connect("mock hub refused connection".into()));
            }
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let peer = MockPeer {
            from_client,
            to_client: Some(to_client),
            reader: FrameReader::new(),
            ready: VecDeque::new(),
        };
        self.shared
            .peers
            .send(peer)
            .map_err(|_| TransportError::Connect("mock hub dropped".into()))?;

        Ok(Box::new(MockLink {
            to_server: Some(to_server),
            from_server,
            reader: FrameReader::new(),
            ready: VecDeque::new(),
        }))
    }
}

impl MockHub {
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_all = refuse;
    }

    pub fn refuse_next(&self, count: usize) {
        self.shared.state.lock().refuse_next = count;
    }

    /// Number of open attempts, refused ones included.
    pub fn opens(&self) -> usize {
        self.shared.state.lock().opens
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.shared.state.lock().tokens.clone()
    }

    /// Next accepted channel; `None` if none arrives within a few seconds.
    pub async fn next_peer(&mut self) -> Option<MockPeer> {
        tokio::time::timeout(PEER_WAIT, self.peers.recv())
            .await
            .ok()
            .flatten()
    }
}

enum ServerEvent {
    Frame(String),
    Fail(String),
}

struct MockLink {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<ServerEvent>,
    reader: FrameReader,
    ready: VecDeque<String>,
}

#[async_trait]
impl HubLink for MockLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let sender = self.to_server.as_ref().ok_or(TransportError::Closed)?;
        sender.send(text).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            match self.from_server.recv().await? {
                ServerEvent::Frame(text) => {
                    let frames = self.reader.push(&text);
                    self.ready.extend(frames);
                }
                ServerEvent::Fail(reason) => return Some(Err(TransportError::Io(reason))),
            }
        }
    }

    async fn close(&mut self) {
        self.to_server = None;
    }
}

/// An invocation observed on the hub side.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCall {
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
}

/// Hub side of one mock channel.
pub struct MockPeer {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: Option<mpsc::UnboundedSender<ServerEvent>>,
    reader: FrameReader,
    ready: VecDeque<String>,
}

impl std::fmt::Debug for MockPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeer")
            .field("open", &self.to_client.is_some())
            .finish()
    }
}

impl MockPeer {
    /// Next raw frame from the client; `None` once the client closed.
    pub async fn recv_frame(&mut self) -> Option<String> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(frame);
            }
            let text = tokio::time::timeout(PEER_WAIT, self.from_client.recv())
                .await
                .ok()
                .flatten()?;
            let frames = self.reader.push(&text);
            self.ready.extend(frames);
        }
    }

    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .map(|tx| tx.send(ServerEvent::Frame(text.into())).is_ok())
            .unwrap_or(false)
    }

    pub fn send(&self, message: &HubMessage) -> bool {
        message
            .encode()
            .map(|frame| self.send_raw(frame))
            .unwrap_or(false)
    }

    /// Server push with a single payload argument.
    pub fn push(&self, target: &str, payload: Value) -> bool {
        self.send(&HubMessage::push(target, vec![payload]))
    }

    pub async fn accept_handshake(&mut self) -> Option<HandshakeRequest> {
        let frame = self.recv_frame().await?;
        let request = HandshakeRequest::decode(&frame).ok()?;
        let reply = HandshakeResponse::accepted().encode().ok()?;
        self.send_raw(reply).then_some(request)
    }

    pub async fn reject_handshake(&mut self, reason: &str) -> Option<()> {
        let frame = self.recv_frame().await?;
        HandshakeRequest::decode(&frame).ok()?;
        let reply = HandshakeResponse::rejected(reason).encode().ok()?;
        self.send_raw(reply).then_some(())
    }

    /// Next client invocation, skipping pings.
    pub async fn expect_call(&mut self) -> Option<ClientCall> {
        loop {
            let frame = self.recv_frame().await?;
            match HubMessage::decode(&frame).ok()? {
                HubMessage::Invocation {
                    invocation_id,
                    target,
                    arguments,
                } => {
                    return Some(ClientCall {
                        invocation_id,
                        target,
                        arguments,
                    });
                }
                HubMessage::Ping => continue,
                _ => return None,
            }
        }
    }

    pub fn complete(&self, call: &ClientCall, result: Option<Value>) -> bool {
        let Some(id) = call.invocation_id.clone() else {
            return false;
        };
        self.send(&HubMessage::Completion {
            invocation_id: id,
            result,
            error: None,
        })
    }

    pub fn reject(&self, call: &ClientCall, error: &str) -> bool {
        let Some(id) = call.invocation_id.clone() else {
            return false;
        };
        self.send(&HubMessage::Completion {
            invocation_id: id,
            result: None,
            error: Some(error.to_string()),
        })
    }

    /// Handshake plus an acknowledged `JoinMatch`; returns the join call.
    pub async fn accept_join(&mut self) -> Option<ClientCall> {
        self.accept_handshake().await?;
        let call = self.expect_call().await?;
        if !call.target.eq_ignore_ascii_case("JoinMatch") {
            return None;
        }
        self.complete(&call, None).then_some(call)
    }

    /// Simulates an abrupt transport failure.
    pub fn fail_link(&mut self, reason: &str) {
        if let Some(tx) = self.to_client.take() {
            let _ = tx.send(ServerEvent::Fail(reason.to_string()));
        }
    }

    /// Closes the hub side cleanly.
    pub fn drop_link(&mut self) {
        self.to_client = None;
    }

    /// Waits until the client side has closed its sender.
    pub async fn wait_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(PEER_WAIT, self.from_client.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn endpoint(token: Option<&str>) -> HubEndpoint {
        HubEndpoint::new(
            url::Url::parse("ws://mock/hubs/match").unwrap(),
            token.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn refused_opens_are_counted() {
        let (transport, hub) = MockTransport::pair();
        hub.refuse_next(1);
        assert!(transport.open(&endpoint(Some("t1"))).await.is_err());
        assert!(transport.open(&endpoint(None)).await.is_ok());
        assert_eq!(hub.opens(), 2);
        assert_eq!(hub.tokens(), vec![Some("t1".to_string()), None]);
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (transport, mut hub) = MockTransport::pair();
        let mut link = transport.open(&endpoint(None)).await.unwrap();
        let mut peer = hub.next_peer().await.expect("peer");

        link.send(HandshakeRequest::default().encode().unwrap())
            .await
            .unwrap();
        assert!(peer.accept_handshake().await.is_some());
        assert_eq!(link.recv().await.unwrap().unwrap(), "{}");

        assert!(peer.push("ReceiveMatchState", json!({"tick": 4})));
        let frame = link.recv().await.unwrap().unwrap();
        assert!(HubMessage::decode(&frame).unwrap().is_target("ReceiveMatchState"));

        peer.fail_link("reset by peer");
        assert!(matches!(link.recv().await, Some(Err(TransportError::Io(_)))));
        assert!(link.recv().await.is_none());
    }

    #[tokio::test]
    async fn client_close_is_visible_to_peer() {
        let (transport, mut hub) = MockTransport::pair();
        let mut link = transport.open(&endpoint(None)).await.unwrap();
        let mut peer = hub.next_peer().await.expect("peer");
        link.close().await;
        assert!(peer.wait_closed().await);
        assert!(link.send("x".into()).await.is_err());
    }
}
