//! WebSocket channel to the game server, using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] dials a fixed `ws://` or `wss://` URL and hands the
//! session driver a fresh [`WebSocketTransport`] for every channel
//! generation. TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), trivia_lobby_client::LobbyError> {
//! use std::sync::Arc;
//! use trivia_lobby_client::{LobbyConfig, LocalSessionCache, SessionClient, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("ws://localhost:8080/lobby");
//! let cache = Arc::new(LocalSessionCache::in_memory());
//! let (client, _events) = SessionClient::start(connector, cache, LobbyConfig::new());
//! client.join("Misty", "AB12CD").await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::error::LobbyError;
use crate::transport::{Connector, Transport};

/// The underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// One open WebSocket channel carrying JSON text frames.
///
/// [`recv`](Transport::recv) is cancel-safe: `StreamExt::next` on the
/// tungstenite stream does not lose frames when dropped.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Io`]. The [`ErrorKind`](std::io::ErrorKind) of an
    /// underlying I/O failure is preserved; anything else maps to
    /// [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, LobbyError> {
        debug!(url = %url, "opening WebSocket");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            LobbyError::Io(std::io::Error::new(kind, e))
        })?;

        debug!(url = %url, "WebSocket open");
        Ok(Self::from_stream(stream))
    }

    /// Wrap a stream set up elsewhere (custom TLS, headers, proxies).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), LobbyError> {
        if self.closed {
            return Err(LobbyError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| LobbyError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(LobbyError::TransportReceive(e.to_string()))),
            };
            match frame {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(close) => {
                    debug!(?close, "server sent close frame");
                    return None;
                }
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Binary(_) => warn!("unexpected binary frame on lobby channel, skipping"),
            }
        }
    }

    async fn close(&mut self) -> Result<(), LobbyError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| LobbyError::TransportSend(e.to_string()))
    }
}

/// Dials the lobby endpoint once per channel generation.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self) -> Result<WebSocketTransport, LobbyError> {
        WebSocketTransport::connect(&self.url).await
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    type ServerStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    /// Accept one WebSocket on an ephemeral port and run `handler` on it.
    async fn serve_once<F, Fut>(handler: F) -> String
    where
        F: FnOnce(ServerStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });
        format!("ws://{addr}")
    }

    #[test]
    fn transport_is_send_and_debug() {
        fn assert_send_debug<T: Send + std::fmt::Debug>() {}
        assert_send_debug::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connector_reports_refused_connections_as_io() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, LobbyError::Io(_)));

        let err = WebSocketTransport::connect("not a url").await.unwrap_err();
        assert!(matches!(err, LobbyError::Io(_)));
    }

    #[tokio::test]
    async fn connector_carries_a_lobby_exchange() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Text(r#"{"type":"welcome","data":{"connectionId":"c1"}}"#.into()))
                .await
                .unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                assert!(text.contains("join_room"));
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect().await.unwrap();
        let welcome = transport.recv().await.unwrap().unwrap();
        assert!(welcome.contains("c1"));

        transport
            .send(r#"{"type":"join_room","data":{"displayName":"Misty","roomCode":"AB12CD"}}"#.into())
            .await
            .unwrap();
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn binary_frames_are_skipped() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Binary(vec![0x01, 0x02].into())).await.unwrap();
            ws.send(Message::Text("after".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "after");
    }

    #[tokio::test]
    async fn closed_transport_refuses_sends_and_closes_idempotently() {
        let url = serve_once(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} }).await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("late".into()).await.unwrap_err();
        assert!(matches!(err, LobbyError::TransportClosed));
    }
}
