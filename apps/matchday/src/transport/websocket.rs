use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hub_proto::FrameReader;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use super::{HubEndpoint, HubLink, HubTransport, TransportError};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket implementation of the push channel.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WebSocketTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// The bearer credential rides both as a header and as the `access_token`
/// query parameter; browser-facing hubs only read the latter.
fn channel_url(endpoint: &HubEndpoint) -> url::Url {
    let mut url = endpoint.url.clone();
    if let Some(token) = endpoint.bearer_token.as_deref() {
        url.query_pairs_mut().append_pair("access_token", token);
    }
    url
}

#[async_trait]
impl HubTransport for WebSocketTransport {
    async fn open(&self, endpoint: &HubEndpoint) -> Result<Box<dyn HubLink>, TransportError> {
        let url = channel_url(endpoint);
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "expected ws:// or wss:// url, got {}",
                endpoint.url
            )));
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))?;
        if let Some(token) = endpoint.bearer_token.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::InvalidEndpoint(err.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        debug!(
            target = "matchday::transport",
            url = %endpoint.url,
            status = %response.status(),
            "websocket channel open"
        );

        Ok(Box::new(WebSocketLink {
            stream,
            reader: FrameReader::new(),
            ready: VecDeque::new(),
        }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    reader: FrameReader,
    ready: VecDeque<String>,
}

#[async_trait]
impl HubLink for WebSocketLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Some(Ok(frame));
            }
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frames = self.reader.push(&text);
                    self.ready.extend(frames);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let frames = self.reader.push(&String::from_utf8_lossy(&bytes));
                    self.ready.extend(frames);
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // ping/pong are answered inside tungstenite
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(TransportError::Io(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!(
                target = "matchday::transport",
                error = %err,
                "websocket close failed"
            );
        }
    }
}
