//! WebSocket wire for the transport channel
//!
//! Production implementation of [`WireTransport`]. The bearer token is
//! carried as connection-time metadata in the upgrade request header,
//! never inside event payloads.

use crate::channel::{ChannelError, WireSink, WireStream, WireTransport};
use crate::wire::{ClientEvent, ServerEvent};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket wire transport
pub struct WsTransport {
    url: Url,
    token: String,
}

impl WsTransport {
    /// Create a wire for the given endpoint and credential
    #[must_use]
    pub fn new(url: Url, token: impl Into<String>) -> Self {
        Self {
            url,
            token: token.into(),
        }
    }
}

#[async_trait]
impl WireTransport for WsTransport {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn WireSink>, Box<dyn WireStream>), ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        let header = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        tracing::debug!(url = %self.url, "websocket connected");

        let (sink, stream) = socket.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsStream { stream })))
    }
}

struct WsSink {
    sink: SplitSink<Socket, WsMessage>,
}

#[async_trait]
impl WireSink for WsSink {
    async fn send(&mut self, event: ClientEvent) -> Result<(), ChannelError> {
        let text = serde_json::to_string(&event)
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        self.sink
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }
}

struct WsStream {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl WireStream for WsStream {
    async fn next_event(&mut self) -> Option<ServerEvent> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => match serde_json::from_str(&text) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        // Unknown event names degrade to a skip, not a disconnect.
                        tracing::warn!(error = %e, "ignoring malformed server event");
                    }
                },
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "websocket read error");
                    return None;
                }
            }
        }
        None
    }
}
