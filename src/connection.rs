//! Lifecycle of the duplex channel to the game server.
//!
//! [`ConnectionManager`] owns at most one live channel at a time. Every
//! channel instance is tagged with a [`Generation`]; everything the channel
//! emits is delivered as a [`Stamped`] event, and anything issued on its
//! behalf (commands, timers) captures the same generation. Opening a new
//! channel disposes the previous one and bumps the generation, so results
//! that arrive late from an abandoned channel can be recognized and dropped
//! with [`ConnectionManager::observe`].
//!
//! Each channel runs in a background task that obtains a transport from the
//! [`Connector`], then multiplexes outgoing commands, the shutdown signal,
//! and incoming frames with `tokio::select!`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::cache::SessionIdentity;
use crate::error::{LobbyError, Result};
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::transport::{Connector, Transport};
use crate::validation;

/// Default bound on obtaining a transport from the connector.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a disposed channel gets to close gracefully.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Generations ─────────────────────────────────────────────────────

/// Monotonically increasing tag identifying one channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    /// The generation before any channel has been opened.
    pub const INITIAL: Self = Self(0);

    pub fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// A value tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Stamped<T> {
    pub generation: Generation,
    pub value: T,
}

impl<T> Stamped<T> {
    pub fn new(generation: Generation, value: T) -> Self {
        Self { generation, value }
    }
}

// ── States & events ─────────────────────────────────────────────────

/// Authoritative connection status of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing opened yet.
    #[default]
    Idle,
    /// Channel requested; transport or handshake pending.
    Connecting,
    /// Handshake complete; the connection id is known.
    Connected,
    /// Channel lost; an automatic retry is scheduled.
    Reconnecting,
    /// Channel closed and no retry is scheduled.
    Disconnected,
    /// Retries exhausted or the server forced us out; needs a manual reconnect.
    Failed,
}

impl ConnectionState {
    /// Short status string suitable for display.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
            Self::Failed => "connection lost",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The connector failed or timed out; the channel never opened.
    ConnectFailed(String),
    /// The transport failed while open.
    Transport(String),
    /// The server closed the channel.
    ClosedByServer,
    /// We closed it (disposal or shutdown).
    ClientClosed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::ClosedByServer => f.write_str("closed by server"),
            Self::ClientClosed => f.write_str("closed by client"),
        }
    }
}

/// Something that happened on one channel instance.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The transport is up; the handshake (`welcome`) is still pending.
    Opened,
    /// A decoded server push.
    Message(ServerMessage),
    /// The channel is gone. Always the last event of a generation.
    Closed(DisconnectReason),
}

// ── Options ─────────────────────────────────────────────────────────

/// Timeouts governing channel setup and teardown.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────

struct Channel {
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// Owns one duplex channel at a time.
pub struct ConnectionManager<C: Connector> {
    connector: Arc<C>,
    options: ConnectionOptions,
    generation: Generation,
    connection_id: Option<ConnectionId>,
    channel: Option<Channel>,
    events_tx: mpsc::UnboundedSender<Stamped<ChannelEvent>>,
    state_tx: watch::Sender<Stamped<ConnectionState>>,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create an idle manager and the receiver of its channel events.
    pub fn new(
        connector: C,
        options: ConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<Stamped<ChannelEvent>>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(Stamped::new(Generation::INITIAL, ConnectionState::Idle));
        let manager = Self {
            connector: Arc::new(connector),
            options,
            generation: Generation::INITIAL,
            connection_id: None,
            channel: None,
            events_tx,
            state_tx,
        };
        (manager, events_rx)
    }

    /// Open a new channel for `identity`, superseding any existing one.
    ///
    /// The previous channel (pending or connected) is disposed first and its
    /// generation stops being current.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Validation`] when the identity has no usable
    /// display name. Nothing touches the network in that case.
    pub async fn open(&mut self, identity: &SessionIdentity) -> Result<Generation> {
        validation::display_name(&identity.display_name)?;

        self.dispose().await;
        self.generation = self.generation.next();
        self.connection_id = None;
        self.set_state(ConnectionState::Connecting);
        debug!(
            generation = %self.generation,
            display_name = %identity.display_name,
            "opening channel"
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(channel_loop(
            Arc::clone(&self.connector),
            self.generation,
            self.options.connect_timeout,
            cmd_rx,
            self.events_tx.clone(),
            shutdown_rx,
        ));
        self.channel = Some(Channel {
            cmd_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        });

        Ok(self.generation)
    }

    /// Close the current channel, if any. Its generation stops being current.
    pub async fn close(&mut self) {
        self.dispose().await;
        self.generation = self.generation.next();
        self.connection_id = None;
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().value
    }

    /// Receiver of state transitions, each stamped with its generation.
    pub fn watch_state(&self) -> watch::Receiver<Stamped<ConnectionState>> {
        self.state_tx.subscribe()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        generation == self.generation
    }

    /// Connection id assigned by the server for the current channel.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Queue `message` on the channel of `generation`.
    ///
    /// # Errors
    ///
    /// - [`LobbyError::StaleGeneration`] if `generation` has been superseded.
    /// - [`LobbyError::NotConnected`] if no channel is live.
    pub fn send(&self, generation: Generation, message: ClientMessage) -> Result<()> {
        if !self.is_current(generation) {
            return Err(LobbyError::StaleGeneration(generation));
        }
        let channel = self.channel.as_ref().ok_or(LobbyError::NotConnected)?;
        debug!(generation = %generation, message = message.name(), "queueing command");
        channel
            .cmd_tx
            .send(message)
            .map_err(|_| LobbyError::NotConnected)
    }

    /// Fold a channel event into the manager's state.
    ///
    /// Returns `false` (and changes nothing) when the event belongs to a
    /// superseded generation; callers must then ignore it as well.
    pub fn observe(&mut self, event: &Stamped<ChannelEvent>) -> bool {
        if !self.is_current(event.generation) {
            debug!(
                stale = %event.generation,
                current = %self.generation,
                "ignoring stale channel event"
            );
            return false;
        }
        match &event.value {
            ChannelEvent::Opened => {}
            ChannelEvent::Message(ServerMessage::Welcome { connection_id }) => {
                self.connection_id = Some(connection_id.clone());
                self.set_state(ConnectionState::Connected);
            }
            ChannelEvent::Message(_) => {}
            ChannelEvent::Closed(reason) => {
                debug!(generation = %event.generation, %reason, "channel closed");
                self.channel = None;
                self.connection_id = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
        true
    }

    /// A retry has been scheduled for the lost channel.
    pub fn mark_reconnecting(&mut self) {
        self.set_state(ConnectionState::Reconnecting);
    }

    /// No further automatic retries will happen.
    pub fn mark_failed(&mut self) {
        self.set_state(ConnectionState::Failed);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self
            .state_tx
            .send_replace(Stamped::new(self.generation, state));
        if previous.value != state {
            debug!(generation = %self.generation, from = %previous.value, to = %state, "connection state");
        }
    }

    /// Signal the channel task to close gracefully, waiting up to the
    /// shutdown timeout before aborting it.
    async fn dispose(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        if let Some(tx) = channel.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = channel.task.take() {
            match tokio::time::timeout(self.options.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("channel task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("channel task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("channel task aborted: {join_err}");
                    }
                }
            }
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("generation", &self.generation)
            .field("state", &self.current_state())
            .field("connection_id", &self.connection_id)
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    fn drop(&mut self) {
        // Cannot await a graceful close here; abort the task instead.
        if let Some(task) = self.channel.as_mut().and_then(|c| c.task.take()) {
            task.abort();
        }
    }
}

// ── Channel loop ────────────────────────────────────────────────────

/// Background task for one channel generation.
///
/// Exits when:
/// - The connector fails or times out
/// - The shutdown signal fires or the command channel closes
/// - The transport returns `None` (server closed connection)
/// - A transport error occurs
async fn channel_loop<C: Connector>(
    connector: Arc<C>,
    generation: Generation,
    connect_timeout: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    events_tx: mpsc::UnboundedSender<Stamped<ChannelEvent>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let emit = |event: ChannelEvent| {
        if events_tx.send(Stamped::new(generation, event)).is_err() {
            debug!(%generation, "channel event receiver dropped");
        }
    };

    let mut transport = tokio::select! {
        _ = &mut shutdown_rx => {
            debug!(%generation, "shutdown before channel opened");
            emit(ChannelEvent::Closed(DisconnectReason::ClientClosed));
            return;
        }
        connected = tokio::time::timeout(connect_timeout, connector.connect()) => {
            match connected {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!(%generation, "connect failed: {e}");
                    emit(ChannelEvent::Closed(DisconnectReason::ConnectFailed(e.to_string())));
                    return;
                }
                Err(_) => {
                    warn!(%generation, "connect timed out after {connect_timeout:?}");
                    emit(ChannelEvent::Closed(DisconnectReason::ConnectFailed(
                        LobbyError::Timeout.to_string(),
                    )));
                    return;
                }
            }
        }
    };

    debug!(%generation, "channel opened");
    emit(ChannelEvent::Opened);

    loop {
        tokio::select! {
            // Queued commands go out before a pending shutdown is honoured.
            biased;

            // Branch 1: outgoing command
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(msg) => {
                        match serde_json::to_string(&msg) {
                            Ok(json) => {
                                if let Err(e) = transport.send(json).await {
                                    error!(%generation, "transport send error: {e}");
                                    emit(ChannelEvent::Closed(DisconnectReason::Transport(e.to_string())));
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to serialize {}: {e}", msg.name());
                            }
                        }
                    }
                    // Command channel closed: the manager dropped the channel.
                    None => {
                        let _ = transport.close().await;
                        emit(ChannelEvent::Closed(DisconnectReason::ClientClosed));
                        break;
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!(%generation, "shutdown signal received");
                let _ = transport.close().await;
                emit(ChannelEvent::Closed(DisconnectReason::ClientClosed));
                break;
            }

            // Branch 3: incoming frame
            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => emit(ChannelEvent::Message(msg)),
                        Err(e) => warn!(%generation, "failed to decode server message: {e}; raw: {text}"),
                    },
                    Some(Err(e)) => {
                        error!(%generation, "transport receive error: {e}");
                        emit(ChannelEvent::Closed(DisconnectReason::Transport(e.to_string())));
                        break;
                    }
                    None => {
                        debug!(%generation, "transport closed by server");
                        emit(ChannelEvent::Closed(DisconnectReason::ClosedByServer));
                        break;
                    }
                }
            }
        }
    }

    debug!(%generation, "channel loop exited");
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::cache::Role;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // ── Mock transport ──────────────────────────────────────────────

    type Incoming = Option<std::result::Result<String, LobbyError>>;

    struct MockTransport {
        incoming: mpsc::UnboundedReceiver<Incoming>,
        sent: mpsc::UnboundedSender<String>,
        closed: Arc<AtomicBool>,
    }

    struct ServerEnd {
        push: mpsc::UnboundedSender<Incoming>,
        sent: mpsc::UnboundedReceiver<String>,
        closed: Arc<AtomicBool>,
    }

    fn mock_pair() -> (MockTransport, ServerEnd) {
        let (push, incoming) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            MockTransport {
                incoming,
                sent: sent_tx,
                closed: Arc::clone(&closed),
            },
            ServerEnd {
                push,
                sent: sent_rx,
                closed,
            },
        )
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), LobbyError> {
            self.sent
                .send(message)
                .map_err(|_| LobbyError::TransportClosed)
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, LobbyError>> {
            match self.incoming.recv().await {
                Some(item) => item,
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> std::result::Result<(), LobbyError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockConnector {
        transports: StdMutex<VecDeque<MockTransport>>,
        attempts: Arc<AtomicUsize>,
    }

    impl MockConnector {
        fn with(transports: Vec<MockTransport>) -> Self {
            Self {
                transports: StdMutex::new(transports.into()),
                attempts: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Transport = MockTransport;

        async fn connect(&self) -> std::result::Result<MockTransport, LobbyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.transports
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LobbyError::Io(std::io::ErrorKind::ConnectionRefused.into()))
        }
    }

    fn identity() -> SessionIdentity {
        SessionIdentity {
            display_name: "Ash".into(),
            role: Role::Host,
            ..SessionIdentity::default()
        }
    }

    fn welcome(id: &str) -> Incoming {
        Some(Ok(serde_json::to_string(&ServerMessage::Welcome {
            connection_id: id.into(),
        })
        .unwrap()))
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn open_rejects_blank_display_name_before_connecting() {
        let connector = MockConnector::default();
        let attempts = Arc::clone(&connector.attempts);
        let (mut manager, _events) = ConnectionManager::new(connector, ConnectionOptions::default());

        let err = manager.open(&SessionIdentity::default()).await.unwrap_err();
        assert!(matches!(err, LobbyError::Validation(_)));
        assert_eq!(manager.current_state(), ConnectionState::Idle);
        assert_eq!(manager.generation(), Generation::INITIAL);

        tokio::task::yield_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn welcome_completes_the_handshake() {
        let (transport, server) = mock_pair();
        let (mut manager, mut events) =
            ConnectionManager::new(MockConnector::with(vec![transport]), ConnectionOptions::default());

        let generation = manager.open(&identity()).await.unwrap();
        assert_eq!(generation.get(), 1);
        assert_eq!(manager.current_state(), ConnectionState::Connecting);

        let opened = events.recv().await.unwrap();
        assert_eq!(opened.value, ChannelEvent::Opened);
        assert!(manager.observe(&opened));
        assert_eq!(manager.current_state(), ConnectionState::Connecting);

        server.push.send(welcome("conn-1")).unwrap();
        let event = events.recv().await.unwrap();
        assert!(manager.observe(&event));
        assert_eq!(manager.current_state(), ConnectionState::Connected);
        assert_eq!(manager.connection_id(), Some("conn-1"));
    }

    #[tokio::test]
    async fn reopening_disposes_previous_channel_and_bumps_generation() {
        let (first, first_server) = mock_pair();
        let (second, _second_server) = mock_pair();
        let (mut manager, mut events) = ConnectionManager::new(
            MockConnector::with(vec![first, second]),
            ConnectionOptions::default(),
        );

        let g1 = manager.open(&identity()).await.unwrap();
        let opened = events.recv().await.unwrap();
        assert_eq!(opened.generation, g1);

        let g2 = manager.open(&identity()).await.unwrap();
        assert!(g2 > g1);
        assert!(first_server.closed.load(Ordering::Relaxed));

        // The first channel's closing event is stale now.
        let closed = events.recv().await.unwrap();
        assert_eq!(closed.generation, g1);
        assert!(!manager.observe(&closed));
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn send_refuses_stale_generation() {
        let (first, _s1) = mock_pair();
        let (second, mut s2) = mock_pair();
        let (mut manager, mut events) = ConnectionManager::new(
            MockConnector::with(vec![first, second]),
            ConnectionOptions::default(),
        );

        let g1 = manager.open(&identity()).await.unwrap();
        let _opened = events.recv().await.unwrap();
        let g2 = manager.open(&identity()).await.unwrap();

        let stale = manager.send(g1, ClientMessage::StartGame { room_code: "AB12CD".into() });
        assert!(matches!(stale, Err(LobbyError::StaleGeneration(g)) if g == g1));

        manager
            .send(g2, ClientMessage::StartGame { room_code: "AB12CD".into() })
            .unwrap();
        let raw = s2.sent.recv().await.unwrap();
        let sent: ClientMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(sent, ClientMessage::StartGame { room_code: "AB12CD".into() });
    }

    #[tokio::test]
    async fn connect_failure_is_reported_as_closed() {
        let (mut manager, mut events) =
            ConnectionManager::new(MockConnector::default(), ConnectionOptions::default());

        manager.open(&identity()).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.value,
            ChannelEvent::Closed(DisconnectReason::ConnectFailed(_))
        ));
        assert!(manager.observe(&event));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.send(event.generation, ClientMessage::SubmitAnswer { answer: "x".into() }),
            Err(LobbyError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn server_close_and_transport_errors_end_the_channel() {
        let (first, s1) = mock_pair();
        let (second, s2) = mock_pair();
        let (mut manager, mut events) = ConnectionManager::new(
            MockConnector::with(vec![first, second]),
            ConnectionOptions::default(),
        );

        manager.open(&identity()).await.unwrap();
        let _opened = events.recv().await.unwrap();
        s1.push.send(None).unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.value, ChannelEvent::Closed(DisconnectReason::ClosedByServer));

        manager.open(&identity()).await.unwrap();
        let _opened = events.recv().await.unwrap();
        s2.push
            .send(Some(Err(LobbyError::TransportReceive("reset".into()))))
            .unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.value,
            ChannelEvent::Closed(DisconnectReason::Transport(_))
        ));
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let (transport, server) = mock_pair();
        let (mut manager, mut events) =
            ConnectionManager::new(MockConnector::with(vec![transport]), ConnectionOptions::default());

        manager.open(&identity()).await.unwrap();
        let _opened = events.recv().await.unwrap();
        server.push.send(Some(Ok("{garbage".into()))).unwrap();
        server.push.send(welcome("conn-9")).unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.value,
            ChannelEvent::Message(ServerMessage::Welcome { .. })
        ));
    }

    #[tokio::test]
    async fn close_invalidates_the_generation() {
        let (transport, server) = mock_pair();
        let (mut manager, mut events) =
            ConnectionManager::new(MockConnector::with(vec![transport]), ConnectionOptions::default());

        let g1 = manager.open(&identity()).await.unwrap();
        let _opened = events.recv().await.unwrap();
        manager.close().await;

        assert!(!manager.is_current(g1));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(server.closed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn state_watch_reports_transitions_with_generation() {
        let (transport, _server) = mock_pair();
        let (mut manager, _events) =
            ConnectionManager::new(MockConnector::with(vec![transport]), ConnectionOptions::default());
        let mut watch = manager.watch_state();

        let generation = manager.open(&identity()).await.unwrap();
        watch.changed().await.unwrap();
        let current = watch.borrow_and_update().clone();
        assert_eq!(current, Stamped::new(generation, ConnectionState::Connecting));
    }

    #[test]
    fn generations_increase() {
        let g = Generation::INITIAL;
        assert!(g.next() > g);
        assert_eq!(g.next().next().get(), 2);
        assert_eq!(g.next().to_string(), "g1");
    }
}
