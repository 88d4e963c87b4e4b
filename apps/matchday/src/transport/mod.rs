use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod mock;
pub mod websocket;

pub use mock::{MockHub, MockPeer, MockTransport};
pub use websocket::WebSocketTransport;

/// Where and how to open the push channel for one match.
#[derive(Debug, Clone)]
pub struct HubEndpoint {
    pub url: Url,
    pub bearer_token: Option<String>,
}

impl HubEndpoint {
    pub fn new(url: Url, bearer_token: Option<String>) -> Self {
        Self { url, bearer_token }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unable to open channel: {0}")]
    Connect(String),
    #[error("channel closed")]
    Closed,
    #[error("channel io error: {0}")]
    Io(String),
    #[error("invalid channel endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Opens push channels. Abstracted so the reconnect and fallback paths can be
/// driven by a scripted transport in tests.
#[async_trait]
pub trait HubTransport: Send + Sync {
    async fn open(&self, endpoint: &HubEndpoint) -> Result<Box<dyn HubLink>, TransportError>;
}

/// One open channel, carrying whole record-separated frames.
#[async_trait]
pub trait HubLink: Send {
    /// Sends pre-encoded frames; the text may hold several frames.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame with the separator stripped. `None` means the
    /// remote closed the channel.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
