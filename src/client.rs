//! Lobby session client.
//!
//! [`SessionClient`] is a thin handle that talks to a background driver task
//! over an unbounded MPSC channel. The driver owns the [`ConnectionManager`],
//! [`SessionNegotiator`], [`RoomStateReconciler`], [`ReconnectionPolicy`] and
//! [`GameStartGate`]; it is the only place their state changes. Events are
//! emitted on a bounded channel ([`tokio::sync::mpsc::Receiver<LobbyEvent>`])
//! returned from [`SessionClient::start`].
//!
//! Everything the driver reacts to carries a [`Generation`]: channel events,
//! settle and retry timers, and command deadlines. Anything stamped with a
//! superseded generation is dropped on arrival.
//!
//! # Example
//!
//! ```rust,ignore
//! let cache = Arc::new(LocalSessionCache::open(FileStore::new(dir), CacheOptions::default()));
//! let (client, mut events) = SessionClient::start(connector, cache, LobbyConfig::new());
//!
//! client.join("Misty", "ab12cd").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LobbyEvent::RoomEstablished { room_code, .. } => { /* … */ }
//!         LobbyEvent::ConnectionLost { .. } => { client.reconnect().await?; }
//!         _ => {}
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::cache::{LocalSessionCache, Role, SessionIdentity, SessionPatch};
use crate::connection::{
    ChannelEvent, ConnectionManager, ConnectionOptions, ConnectionState, DisconnectReason,
    Generation, Stamped,
};
use crate::error::{LobbyError, Result};
use crate::event::LobbyEvent;
use crate::negotiator::{SessionNegotiator, DEFAULT_SETTLE_DELAY};
use crate::protocol::{ClientMessage, RoomSettings, RoomUpdatePayload, ServerMessage};
use crate::reconciler::{ReconcileOutcome, RoomStateReconciler, RoomView};
use crate::reconnect::{
    self, DisconnectClass, PolicyDecision, PolicyState, ReconnectionPolicy, RetryOptions,
};
use crate::start_gate::GameStartGate;
use crate::transport::Connector;
use crate::validation;

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default time a command may wait for its server answer.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionClient`].
///
/// # Example
///
/// ```
/// use trivia_lobby_client::client::LobbyConfig;
/// use std::time::Duration;
///
/// let config = LobbyConfig::new()
///     .with_max_retries(3)
///     .with_retry_delay(Duration::from_secs(1))
///     .with_event_channel_capacity(64);
/// assert_eq!(config.retry.max_retries, 3);
/// ```
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Settings sent with `create_room` when hosting.
    pub room_settings: RoomSettings,
    /// Pause between the handshake and the negotiation request.
    ///
    /// Defaults to **300 ms**.
    pub settle_delay: Duration,
    /// How long `create_room`, `join_room`, `update_room_settings` and
    /// `start_game` may go unanswered.
    ///
    /// Defaults to **10 seconds**. An unanswered negotiation counts as a lost
    /// channel; other commands only report [`LobbyEvent::CommandTimedOut`].
    pub command_timeout: Duration,
    /// Automatic reconnection bounds.
    pub retry: RetryOptions,
    /// Channel connect and shutdown timeouts.
    pub connection: ConnectionOptions,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) so the driver never blocks. [`LobbyEvent::ConnectionLost`] and
    /// fatal [`LobbyEvent::RoomError`]s are always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            room_settings: RoomSettings::default(),
            settle_delay: DEFAULT_SETTLE_DELAY,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            retry: RetryOptions::default(),
            connection: ConnectionOptions::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl LobbyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_room_settings(mut self, settings: RoomSettings) -> Self {
        self.room_settings = settings;
        self
    }

    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Number of automatic retries before giving up. Zero disables them.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connection.connect_timeout = timeout;
        self
    }

    /// Time a disposed channel gets to close gracefully before its task is
    /// aborted.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.connection.shutdown_timeout = timeout;
        self
    }

    /// Defaults to **256**. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }
}

// ── Driver messages ─────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests from the handle to the driver.
enum Intent {
    Connect {
        settings: Option<RoomSettings>,
        reply: Reply<Generation>,
    },
    UpdateSettings {
        settings: RoomSettings,
        reply: Reply<()>,
    },
    StartGame {
        reply: Reply<bool>,
    },
    SubmitAnswer {
        answer: String,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    /// Handshake settled; negotiate.
    Settle,
    /// Automatic retry number `attempt` is due.
    Retry { attempt: u32 },
    /// Command `id` ran out of time.
    CommandDeadline { id: u64 },
}

/// The server push that answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Room,
    Settings,
    Start,
}

#[derive(Debug)]
struct PendingCommand {
    id: u64,
    generation: Generation,
    awaiting: Awaiting,
    command: &'static str,
}

// ── Shared state ────────────────────────────────────────────────────

/// State published by the driver for the handle's accessors.
#[derive(Default)]
struct SharedState {
    room: Mutex<Option<RoomView>>,
    policy: Mutex<PolicyState>,
    can_start: AtomicBool,
}

// ── Client handle ───────────────────────────────────────────────────

/// Async handle to a lobby session.
///
/// Created via [`SessionClient::start`], which spawns the driver task and
/// returns this handle together with an event receiver. Methods return once
/// the driver has accepted (or refused) the request; server answers arrive as
/// [`LobbyEvent`]s.
pub struct SessionClient {
    intent_tx: mpsc::UnboundedSender<Intent>,
    cache: Arc<LocalSessionCache>,
    shared: Arc<SharedState>,
    state_rx: watch::Receiver<Stamped<ConnectionState>>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl SessionClient {
    /// Spawn the driver and return a handle plus event receiver.
    ///
    /// Nothing connects until [`connect`](Self::connect), [`host`](Self::host)
    /// or [`join`](Self::join) is called.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start<C: Connector>(
        connector: C,
        cache: Arc<LocalSessionCache>,
        config: LobbyConfig,
    ) -> (Self, mpsc::Receiver<LobbyEvent>) {
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let (manager, channel_rx) = ConnectionManager::new(connector, config.connection);
        let state_rx = manager.watch_state();
        let shared = Arc::new(SharedState::default());
        let shutdown_timeout = config.connection.shutdown_timeout;

        let driver = Driver {
            cache: Arc::clone(&cache),
            shared: Arc::clone(&shared),
            manager,
            negotiator: SessionNegotiator::new(),
            reconciler: RoomStateReconciler::new(),
            policy: ReconnectionPolicy::new(config.retry),
            gate: GameStartGate::new(),
            room_settings: config.room_settings,
            config,
            pending: Vec::new(),
            next_command_id: 0,
            last_state: ConnectionState::Idle,
            timer_tx,
            event_tx,
        };
        let task = tokio::spawn(driver.run(intent_rx, channel_rx, timer_rx, shutdown_rx));

        let client = Self {
            intent_tx,
            cache,
            shared,
            state_rx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (client, event_rx)
    }

    // ── Session entry ───────────────────────────────────────────────

    /// Remember `display_name` as a host and open a channel that creates a
    /// new room with `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Validation`] for a bad name or settings; nothing
    /// is cached or sent in that case.
    pub async fn host(&self, display_name: &str, settings: RoomSettings) -> Result<Generation> {
        let display_name = validation::display_name(display_name)?;
        validation::settings(&settings)?;
        self.cache.set(
            SessionPatch::new()
                .with_display_name(display_name)
                .with_role(Role::Host)
                .without_room_code(),
        );
        self.request(|reply| Intent::Connect {
            settings: Some(settings),
            reply,
        })
        .await
    }

    /// Remember `display_name` and `room_code` as a guest and open a channel
    /// that joins that room.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Validation`] for a bad name or room code.
    pub async fn join(&self, display_name: &str, room_code: &str) -> Result<Generation> {
        let display_name = validation::display_name(display_name)?;
        let room_code = validation::room_code(room_code)?;
        self.cache.set(
            SessionPatch::new()
                .with_display_name(display_name)
                .with_role(Role::Guest)
                .with_room_code(room_code),
        );
        self.request(|reply| Intent::Connect {
            settings: None,
            reply,
        })
        .await
    }

    /// Open a channel for the cached identity (e.g. after a page reload).
    ///
    /// # Errors
    ///
    /// - [`LobbyError::Validation`] if the cached display name is unusable.
    /// - [`LobbyError::MissingRoomCode`] for a guest with no cached code.
    pub async fn connect(&self) -> Result<Generation> {
        self.request(|reply| Intent::Connect {
            settings: None,
            reply,
        })
        .await
    }

    /// Manual reconnect. Supersedes any live or pending channel and resets
    /// the automatic retry budget.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn reconnect(&self) -> Result<Generation> {
        debug!("manual reconnect requested");
        self.connect().await
    }

    // ── Room commands ───────────────────────────────────────────────

    /// Host only: change the room settings.
    ///
    /// # Errors
    ///
    /// - [`LobbyError::Validation`] for out-of-range settings.
    /// - [`LobbyError::NotInRoom`] before the room is established.
    /// - [`LobbyError::NotHost`] for guests.
    pub async fn update_settings(&self, settings: RoomSettings) -> Result<()> {
        validation::settings(&settings)?;
        self.request(|reply| Intent::UpdateSettings { settings, reply })
            .await
    }

    /// Send `start_game` if the gate allows it.
    ///
    /// Returns `Ok(false)` (and logs why) when the local player is not the
    /// host, the roster is too small, or the game was already started on this
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the channel is gone.
    pub async fn start_game(&self) -> Result<bool> {
        self.request(|reply| Intent::StartGame { reply }).await
    }

    /// Gameplay collaborator: submit an answer on the live channel.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if no channel is live.
    pub async fn submit_answer(&self, answer: impl Into<String>) -> Result<()> {
        let answer = answer.into();
        self.request(|reply| Intent::SubmitAnswer { answer, reply })
            .await
    }

    /// Leave the room, close the channel and forget the cached room code.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the client has shut down.
    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Intent::Leave { reply }).await
    }

    /// Shut down the driver, closing any live channel.
    ///
    /// After this returns the event receiver yields `None` once drained.
    pub async fn shutdown(&mut self) {
        debug!("SessionClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // The driver itself waits up to one shutdown timeout for the channel.
        let limit = self.shutdown_timeout.saturating_mul(2);
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(limit, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session driver terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session driver did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session driver aborted: {join_err}");
                    }
                }
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().value
    }

    /// Receiver of connection state transitions, stamped with their generation.
    pub fn watch_state(&self) -> watch::Receiver<Stamped<ConnectionState>> {
        self.state_rx.clone()
    }

    /// The latest reconciled room, if any snapshot arrived on the current channel.
    pub async fn room(&self) -> Option<RoomView> {
        self.shared.room.lock().await.clone()
    }

    pub async fn policy_state(&self) -> PolicyState {
        *self.shared.policy.lock().await
    }

    /// Whether [`start_game`](Self::start_game) would currently send.
    pub fn can_start(&self) -> bool {
        self.shared.can_start.load(Ordering::Acquire)
    }

    pub fn identity(&self) -> SessionIdentity {
        self.cache.get()
    }

    pub fn cache(&self) -> &Arc<LocalSessionCache> {
        &self.cache
    }

    // ── Internal helpers ────────────────────────────────────────────

    async fn request<T>(&self, intent: impl FnOnce(Reply<T>) -> Intent) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.intent_tx
            .send(intent(reply))
            .map_err(|_| LobbyError::NotConnected)?;
        rx.await.map_err(|_| LobbyError::NotConnected)?
    }
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.connection_state())
            .field("can_start", &self.can_start())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        // Cannot await a graceful shutdown here; abort the driver. Dropping
        // it aborts the live channel task too.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Driver ──────────────────────────────────────────────────────────

struct Driver<C: Connector> {
    cache: Arc<LocalSessionCache>,
    shared: Arc<SharedState>,
    config: LobbyConfig,
    manager: ConnectionManager<C>,
    negotiator: SessionNegotiator,
    reconciler: RoomStateReconciler,
    policy: ReconnectionPolicy,
    gate: GameStartGate,
    /// Settings a host sends with `create_room`; follows accepted updates.
    room_settings: RoomSettings,
    pending: Vec<PendingCommand>,
    next_command_id: u64,
    last_state: ConnectionState,
    timer_tx: mpsc::UnboundedSender<Stamped<Timer>>,
    event_tx: mpsc::Sender<LobbyEvent>,
}

impl<C: Connector> Driver<C> {
    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut channel_events: mpsc::UnboundedReceiver<Stamped<ChannelEvent>>,
        mut timers: mpsc::UnboundedReceiver<Stamped<Timer>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        debug!("session driver started");

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("shutdown signal received");
                    break;
                }
                intent = intents.recv() => match intent {
                    Some(intent) => self.on_intent(intent).await,
                    // Handle dropped.
                    None => break,
                },
                Some(event) = channel_events.recv() => self.on_channel_event(event).await,
                Some(timer) = timers.recv() => self.on_timer(timer).await,
            }
            self.publish().await;
        }

        self.manager.close().await;
        self.publish().await;
        debug!("session driver exited");
    }

    // ── Intents ─────────────────────────────────────────────────────

    async fn on_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Connect { settings, reply } => {
                if let Some(settings) = settings {
                    self.room_settings = settings;
                }
                self.policy.manual_reconnect();
                let _ = reply.send(self.open_channel().await);
            }
            Intent::UpdateSettings { settings, reply } => {
                let _ = reply.send(self.update_settings(settings));
            }
            Intent::StartGame { reply } => {
                let _ = reply.send(self.start_game());
            }
            Intent::SubmitAnswer { answer, reply } => {
                let generation = self.manager.generation();
                let _ = reply.send(
                    self.manager
                        .send(generation, ClientMessage::SubmitAnswer { answer }),
                );
            }
            Intent::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Open a fresh channel for the cached identity. The room view, pending
    /// commands and start gate all begin anew with the new generation.
    async fn open_channel(&mut self) -> Result<Generation> {
        let identity = self.cache.get();
        if identity.role == Role::Guest {
            let code = identity
                .room_code
                .as_deref()
                .filter(|code| !code.trim().is_empty())
                .ok_or(LobbyError::MissingRoomCode)?;
            validation::room_code(code)?;
        }

        let generation = self.manager.open(&identity).await?;
        self.reconciler.reset(generation);
        self.pending.clear();
        Ok(generation)
    }

    fn update_settings(&mut self, settings: RoomSettings) -> Result<()> {
        let view = self.reconciler.view().ok_or(LobbyError::NotInRoom)?;
        let room_code = view.room_code.clone().ok_or(LobbyError::NotInRoom)?;
        if !view.is_host {
            return Err(LobbyError::NotHost);
        }
        let generation = view.generation;
        self.manager.send(
            generation,
            ClientMessage::UpdateRoomSettings {
                room_code,
                settings,
            },
        )?;
        self.room_settings = settings;
        self.track(generation, Awaiting::Settings, "update_room_settings");
        Ok(())
    }

    fn start_game(&mut self) -> Result<bool> {
        let Some(message) = self.gate.start(self.reconciler.view()) else {
            return Ok(false);
        };
        let generation = self.manager.generation();
        if let Err(e) = self.manager.send(generation, message) {
            self.gate.rearm();
            return Err(e);
        }
        self.track(generation, Awaiting::Start, "start_game");
        Ok(true)
    }

    async fn leave(&mut self) {
        let room_code = self.reconciler.view().and_then(|v| v.room_code.clone());
        if let Some(room_code) = room_code {
            let generation = self.manager.generation();
            if let Err(e) = self
                .manager
                .send(generation, ClientMessage::LeaveRoom { room_code })
            {
                debug!("leave_room not sent: {e}");
            }
        }
        self.manager.close().await;
        self.reconciler.reset(self.manager.generation());
        self.pending.clear();
        self.gate.rearm();
        self.policy.manual_reconnect();
        self.cache.set(SessionPatch::new().without_room_code());
    }

    // ── Channel events ──────────────────────────────────────────────

    async fn on_channel_event(&mut self, event: Stamped<ChannelEvent>) {
        if !self.manager.observe(&event) {
            return;
        }
        let generation = event.generation;
        match event.value {
            ChannelEvent::Opened => {}
            ChannelEvent::Message(message) => self.on_server_message(generation, message).await,
            ChannelEvent::Closed(reason) => {
                self.pending.retain(|p| p.generation != generation);
                if let Some(class) = reconnect::classify(&reason) {
                    self.on_lost(class, &reason).await;
                }
            }
        }
    }

    async fn on_server_message(&mut self, generation: Generation, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { connection_id } => {
                self.emit(LobbyEvent::Connected { connection_id });
                self.schedule(generation, Timer::Settle, self.config.settle_delay);
            }
            ServerMessage::RoomUpdate(payload) => self.on_room_update(generation, *payload),
            ServerMessage::RoomError { message, fatal } => {
                self.on_room_error(generation, message, fatal).await;
            }
            ServerMessage::GameStarted { settings } => {
                self.resolve(generation, |a| a == Awaiting::Start);
                debug!(%generation, "game started");
                self.emit(LobbyEvent::GameStarted { settings });
            }
            ServerMessage::GameQuestion(value) => self.emit(LobbyEvent::GameQuestion(value)),
            ServerMessage::ShowAnswer(value) => self.emit(LobbyEvent::ShowAnswer(value)),
            ServerMessage::GameOver(value) => self.emit(LobbyEvent::GameOver(value)),
        }
    }

    fn on_room_update(&mut self, generation: Generation, payload: RoomUpdatePayload) {
        let negotiated = self.negotiator.on_response(generation);
        self.resolve(generation, |a| matches!(a, Awaiting::Room | Awaiting::Settings));

        let self_id = self.manager.connection_id().unwrap_or_default().to_string();
        let ReconcileOutcome::Applied { newly_established } =
            self.reconciler.apply(generation, &self_id, payload)
        else {
            return;
        };
        // The retry count resets on a negotiated room, not on a bare handshake.
        if negotiated {
            self.policy.on_connected();
        }
        let Some(view) = self.reconciler.view().cloned() else {
            return;
        };

        if view.is_host {
            self.room_settings = view.settings;
        }
        let established = newly_established
            .then(|| view.room_code.clone())
            .flatten()
            .map(|room_code| (room_code, view.is_host));
        self.emit(LobbyEvent::RoomUpdated(Box::new(view)));

        if let Some((room_code, is_host)) = established {
            self.cache
                .set(SessionPatch::new().with_room_code(room_code.clone()));
            self.emit(LobbyEvent::RoomEstablished { room_code, is_host });
        }
    }

    async fn on_room_error(&mut self, generation: Generation, message: String, fatal: bool) {
        if !fatal {
            // Errors carry no command id; they answer the oldest command in flight.
            match self.resolve_oldest(generation) {
                Some(Awaiting::Room) => {
                    self.negotiator.on_response(generation);
                }
                Some(Awaiting::Start) => self.gate.rearm(),
                Some(Awaiting::Settings) | None => {}
            }
            warn!(%generation, "room error: {message}");
            self.emit(LobbyEvent::RoomError { message, fatal });
            return;
        }

        warn!(%generation, "fatal room error: {message}");
        self.negotiator.on_response(generation);
        self.resolve(generation, |_| true);
        self.cache.set(SessionPatch::new().without_room_code());
        self.policy.on_disconnect(DisconnectClass::Forced);
        self.manager.close().await;
        self.reconciler.reset(self.manager.generation());
        self.emit_critical(LobbyEvent::RoomError { message, fatal })
            .await;
    }

    /// Run the reconnection policy for a lost channel.
    async fn on_lost(&mut self, class: DisconnectClass, reason: &DisconnectReason) {
        match self.policy.on_disconnect(class) {
            PolicyDecision::Retry { attempt, delay } => {
                self.manager.mark_reconnecting();
                self.emit(LobbyEvent::Reconnecting { attempt, delay });
                self.schedule(self.manager.generation(), Timer::Retry { attempt }, delay);
            }
            PolicyDecision::GiveUp => {
                self.manager.mark_failed();
                self.emit_critical(LobbyEvent::ConnectionLost {
                    reason: reason.to_string(),
                })
                .await;
            }
            PolicyDecision::Ignore => {}
        }
    }

    // ── Timers ──────────────────────────────────────────────────────

    async fn on_timer(&mut self, timer: Stamped<Timer>) {
        let generation = timer.generation;
        if !self.manager.is_current(generation) {
            debug!(stale = %generation, timer = ?timer.value, "ignoring stale timer");
            return;
        }
        match timer.value {
            Timer::Settle => self.negotiate(generation).await,
            Timer::Retry { attempt } => {
                if !self.policy.is_pending(attempt) {
                    return;
                }
                debug!(attempt, "automatic reconnect");
                if let Err(e) = self.open_channel().await {
                    warn!("automatic reconnect refused: {e}");
                    self.policy.on_disconnect(DisconnectClass::Forced);
                    self.manager.mark_failed();
                    self.emit_critical(LobbyEvent::ConnectionLost {
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
            Timer::CommandDeadline { id } => self.on_deadline(id).await,
        }
    }

    async fn negotiate(&mut self, generation: Generation) {
        if self.manager.current_state() != ConnectionState::Connected {
            return;
        }
        let identity = self.cache.get();
        match self
            .negotiator
            .request(generation, &identity, self.room_settings)
        {
            Ok(Some(message)) => {
                let command = message.name();
                match self.manager.send(generation, message) {
                    Ok(()) => self.track(generation, Awaiting::Room, command),
                    Err(e) => warn!(%generation, "{command} not sent: {e}"),
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%generation, "cannot negotiate: {e}");
                self.manager.close().await;
                self.emit(LobbyEvent::NeedsRoomCode {
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn on_deadline(&mut self, id: u64) {
        let Some(index) = self.pending.iter().position(|p| p.id == id) else {
            return;
        };
        let pending = self.pending.remove(index);
        warn!(
            generation = %pending.generation,
            command = pending.command,
            "no answer within {:?}",
            self.config.command_timeout
        );
        self.emit(LobbyEvent::CommandTimedOut {
            command: pending.command,
        });

        match pending.awaiting {
            Awaiting::Room => {
                // Treat a silent server like a dropped channel.
                self.manager.close().await;
                let reason = DisconnectReason::Transport(LobbyError::Timeout.to_string());
                self.on_lost(DisconnectClass::Retryable, &reason).await;
            }
            Awaiting::Start => self.gate.rearm(),
            Awaiting::Settings => {}
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn schedule(&self, generation: Generation, timer: Timer, delay: Duration) {
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The driver may be gone; nothing to do then.
            let _ = timer_tx.send(Stamped::new(generation, timer));
        });
    }

    fn track(&mut self, generation: Generation, awaiting: Awaiting, command: &'static str) {
        let id = self.next_command_id;
        self.next_command_id = self.next_command_id.wrapping_add(1);
        self.pending.push(PendingCommand {
            id,
            generation,
            awaiting,
            command,
        });
        self.schedule(
            generation,
            Timer::CommandDeadline { id },
            self.config.command_timeout,
        );
    }

    /// Drop pending commands of `generation` answered by a server push.
    fn resolve(
        &mut self,
        generation: Generation,
        answers: impl Fn(Awaiting) -> bool,
    ) -> Vec<Awaiting> {
        let mut resolved = Vec::new();
        self.pending.retain(|p| {
            if p.generation == generation && answers(p.awaiting) {
                resolved.push(p.awaiting);
                false
            } else {
                true
            }
        });
        resolved
    }

    /// Drop the oldest pending command of `generation`, if any.
    fn resolve_oldest(&mut self, generation: Generation) -> Option<Awaiting> {
        let index = self.pending.iter().position(|p| p.generation == generation)?;
        Some(self.pending.remove(index).awaiting)
    }

    /// Refresh the handle's view of driver state and report status changes.
    async fn publish(&mut self) {
        let view = self.reconciler.view().cloned();
        self.shared
            .can_start
            .store(self.gate.can_start(view.as_ref()), Ordering::Release);
        *self.shared.room.lock().await = view;
        *self.shared.policy.lock().await = self.policy.state();

        let state = self.manager.current_state();
        if state != self.last_state {
            self.last_state = state;
            self.emit(LobbyEvent::StatusChanged(state));
        }
    }

    /// Emit an event. If the channel is full, log a warning and drop the
    /// event so the driver never blocks.
    fn emit(&self, event: LobbyEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!("event channel full, dropping event: {dropped:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }

    /// Emit an event the UI must not miss, waiting for channel capacity.
    async fn emit_critical(&self, event: LobbyEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("event channel closed, receiver dropped");
        }
    }
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
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Transport that never yields; only its type is needed.
    struct Idle;

    #[async_trait]
    impl Transport for Idle {
        async fn send(&mut self, _message: String) -> std::result::Result<(), LobbyError> {
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, LobbyError>> {
            std::future::pending().await
        }

        async fn close(&mut self) -> std::result::Result<(), LobbyError> {
            Ok(())
        }
    }

    /// Connector whose every attempt is refused.
    #[derive(Default)]
    struct Refusing {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for Refusing {
        type Transport = Idle;

        async fn connect(&self) -> std::result::Result<Idle, LobbyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(LobbyError::Io(std::io::ErrorKind::ConnectionRefused.into()))
        }
    }

    fn client(config: LobbyConfig) -> (SessionClient, mpsc::Receiver<LobbyEvent>, Arc<AtomicUsize>) {
        let connector = Refusing::default();
        let attempts = Arc::clone(&connector.attempts);
        let cache = Arc::new(LocalSessionCache::in_memory());
        let (client, events) = SessionClient::start(connector, cache, config);
        (client, events, attempts)
    }

    #[test]
    fn config_defaults() {
        let config = LobbyConfig::new();
        assert_eq!(config.settle_delay, Duration::from_millis(300));
        assert_eq!(config.command_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.retry_delay, Duration::from_secs(2));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.room_settings, RoomSettings::default());
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config = LobbyConfig::new().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[tokio::test]
    async fn join_rejects_bad_input_before_connecting() {
        let (mut client, _events, attempts) = client(LobbyConfig::new());

        let err = client.join(" ", "AB12CD").await.unwrap_err();
        assert!(matches!(err, LobbyError::Validation(_)));
        let err = client.join("Misty", "AB-12").await.unwrap_err();
        assert!(matches!(err, LobbyError::Validation(_)));

        assert_eq!(client.identity(), SessionIdentity::default());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn guest_without_room_code_is_refused() {
        let (mut client, _events, attempts) = client(LobbyConfig::new());
        client
            .cache()
            .set(SessionPatch::new().with_display_name("Misty").with_role(Role::Guest));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, LobbyError::MissingRoomCode));
        assert_eq!(client.connection_state(), ConnectionState::Idle);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn room_commands_need_a_room() {
        let (mut client, _events, _attempts) = client(LobbyConfig::new());

        assert!(matches!(
            client.update_settings(RoomSettings::default()).await,
            Err(LobbyError::NotInRoom)
        ));
        assert!(!client.start_game().await.unwrap());
        assert!(!client.can_start());
        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_exhaust_retries() {
        let (mut client, mut events, attempts) = client(LobbyConfig::new().with_max_retries(2));

        client.host("Ash", RoomSettings::default()).await.unwrap();

        let mut retries = Vec::new();
        let mut lost = false;
        loop {
            match events.recv().await.unwrap() {
                LobbyEvent::Reconnecting { attempt, delay } => {
                    assert_eq!(delay, Duration::from_secs(2));
                    retries.push(attempt);
                }
                LobbyEvent::ConnectionLost { .. } => lost = true,
                LobbyEvent::StatusChanged(ConnectionState::Failed) => break,
                _ => {}
            }
        }

        assert!(lost);
        assert_eq!(retries, [1, 2]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(client.policy_state().await, PolicyState::GivenUp);
        assert_eq!(client.connection_state(), ConnectionState::Failed);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn requests_after_shutdown_fail() {
        let (mut client, _events, _attempts) = client(LobbyConfig::new());
        client.shutdown().await;
        client.shutdown().await;

        assert!(matches!(
            client.submit_answer("42").await,
            Err(LobbyError::NotConnected)
        ));
    }
}
