//! The two seams between the session driver and the network.
//!
//! A [`Transport`] is one open duplex channel carrying JSON text frames. The
//! lobby client throws a channel away on every reconnect, so it never builds
//! transports itself: it asks a [`Connector`] for a fresh one per generation.
//!
//! # A channel-backed connector
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tokio::sync::{mpsc, Mutex};
//! use trivia_lobby_client::error::LobbyError;
//! use trivia_lobby_client::transport::{Connector, Transport};
//!
//! struct Pipe {
//!     out: mpsc::UnboundedSender<String>,
//!     inbox: mpsc::UnboundedReceiver<String>,
//! }
//!
//! #[async_trait]
//! impl Transport for Pipe {
//!     async fn send(&mut self, message: String) -> Result<(), LobbyError> {
//!         self.out.send(message).map_err(|_| LobbyError::TransportClosed)
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, LobbyError>> {
//!         self.inbox.recv().await.map(Ok)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), LobbyError> {
//!         self.inbox.close();
//!         Ok(())
//!     }
//! }
//!
//! /// Hands out pre-built pipes, one per channel generation.
//! struct Pipes(Mutex<Vec<Pipe>>);
//!
//! #[async_trait]
//! impl Connector for Pipes {
//!     type Transport = Pipe;
//!
//!     async fn connect(&self) -> Result<Pipe, LobbyError> {
//!         self.0.lock().await.pop().ok_or(LobbyError::NotConnected)
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::LobbyError;

/// One duplex channel of whole JSON text frames.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) runs inside `tokio::select!` and **must** be
/// cancel-safe: a dropped `recv` future may not lose a frame. Wrapping an
/// `mpsc::Receiver` or a tungstenite stream satisfies this.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::TransportSend`] if the message could not be sent.
    async fn send(&mut self, message: String) -> Result<(), LobbyError>;

    /// Next frame from the server. `Some(Err(_))` is a transport failure and
    /// is retried by the reconnection policy; `None` means the server closed
    /// the channel, which is not retried.
    async fn recv(&mut self) -> Option<Result<String, LobbyError>>;

    /// Close gracefully. Called at most once per disposal; resources must be
    /// released even when the close handshake fails.
    ///
    /// # Errors
    ///
    /// Whatever the close handshake reported. Disposal proceeds regardless.
    async fn close(&mut self) -> Result<(), LobbyError>;
}

/// Opens new connected [`Transport`]s to the game server.
///
/// Called once per channel generation: the initial open, every automatic
/// retry and every manual reconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Establish a new channel.
    ///
    /// # Errors
    ///
    /// Any [`LobbyError`] describing why the channel could not be opened.
    /// These are treated as retryable connection failures.
    async fn connect(&self) -> Result<Self::Transport, LobbyError>;
}
