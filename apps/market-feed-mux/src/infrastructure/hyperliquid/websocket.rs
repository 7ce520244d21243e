//! WebSocket Transport
//!
//! Opens the upstream connection with `tokio-tungstenite` and adapts it to
//! the text-frame [`TransportLink`] the supervisor drives.
//!
//! # Stream URL
//!
//! - Mainnet: `wss://api.hyperliquid.xyz/ws`
//! - Testnet: `wss://api.hyperliquid-testnet.xyz/ws`
//!
//! Protocol-level pings from the server are answered by tungstenite; the
//! application-level `{"method":"ping"}` keep-alive is the supervisor's job.

use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{Transport, TransportError, TransportLink};

/// Mainnet WebSocket endpoint.
pub const MAINNET_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Testnet WebSocket endpoint.
pub const TESTNET_URL: &str = "wss://api.hyperliquid-testnet.xyz/ws";

/// Default time allowed for the TCP, TLS and WebSocket handshakes.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`Transport`] over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Transport for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        tracing::debug!(url = %self.url, "Opening WebSocket");

        let connect = tokio_tungstenite::connect_async(self.url.as_str());
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "handshake timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|message| future::ready(inbound(message)));

        Ok(TransportLink::new(sink, stream))
    }
}

/// Map one WebSocket message to a text frame, skipping control messages.
fn inbound(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Ok(text)),
            Err(_) => {
                tracing::warn!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Ok(Message::Close(frame)) => {
            let (code, reason) = frame.map_or((None, String::new()), |frame| {
                (Some(u16::from(frame.code)), frame.reason.as_str().to_owned())
            });
            Some(Err(TransportError::Closed { code, reason }))
        }
        Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn builder_sets_timeout() {
        let transport =
            WebSocketTransport::new(TESTNET_URL).with_connect_timeout(Duration::from_secs(3));
        assert_eq!(transport.url(), TESTNET_URL);
        assert_eq!(transport.connect_timeout, Duration::from_secs(3));
    }

    #[test]
    fn control_messages_are_skipped() {
        assert!(inbound(Ok(Message::Ping(Vec::new().into()))).is_none());
        assert!(inbound(Ok(Message::Pong(Vec::new().into()))).is_none());
        assert_eq!(
            inbound(Ok(Message::Text("{}".into()))),
            Some(Ok("{}".to_string()))
        );
        assert_eq!(
            inbound(Ok(Message::Close(None))),
            Some(Err(TransportError::Closed {
                code: None,
                reason: String::new()
            }))
        );
    }

    #[tokio::test]
    async fn round_trips_text_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let request = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(format!("echo:{}", request.to_text().unwrap()).into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let transport = WebSocketTransport::new(format!("ws://{addr}"));
        let TransportLink {
            mut sink,
            mut stream,
        } = transport.open().await.unwrap();

        sink.send(r#"{"method":"ping"}"#.to_string()).await.unwrap();
        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply, r#"echo:{"method":"ping"}"#);

        let closed = stream.next().await.unwrap();
        assert!(matches!(closed, Err(TransportError::Closed { .. })));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = WebSocketTransport::new(format!("ws://{addr}"))
            .open()
            .await
            .unwrap_err();

        assert!(matches!(error, TransportError::Connect(_)));
    }
}
