//! Durable cache of the last-known session identity.
//!
//! [`LocalSessionCache`] is the one piece of state shared by every lobby
//! component. It holds a single [`SessionIdentity`] record, persists it
//! through a [`SessionStore`] under one key, and notifies subscribers
//! synchronously, in call order, after every `set`/`clear`.
//!
//! The cache is an explicit object: construct it once and hand an
//! `Arc<LocalSessionCache>` to whoever needs it.
//!
//! ```
//! use trivia_lobby_client::cache::{LocalSessionCache, Role, SessionPatch};
//!
//! let cache = LocalSessionCache::in_memory();
//! let identity = cache.set(
//!     SessionPatch::new()
//!         .with_display_name("Ash")
//!         .with_role(Role::Host),
//! );
//! assert_eq!(identity.display_name, "Ash");
//! assert!(identity.room_code.is_none());
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{LobbyError, Result};

/// Key under which the session record is stored by default.
pub const DEFAULT_STORAGE_KEY: &str = "trivia_lobby_session";

/// Records older than this are purged on the next read.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60 * 60);

// ── Identity ────────────────────────────────────────────────────────

/// Which side of room negotiation this client plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Role {
    /// Creates the room and controls its settings.
    Host,
    /// Joins an existing room by code.
    #[default]
    Guest,
}

/// The last-known identity of the local player.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionIdentity {
    pub display_name: String,
    /// `None` until the server assigns or confirms a room.
    pub room_code: Option<String>,
    pub role: Role,
    pub last_updated: Option<DateTime<Utc>>,
}

/// A partial update merged into the cached [`SessionIdentity`].
///
/// Fields left unset keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub display_name: Option<String>,
    /// `Some(None)` clears the room code.
    pub room_code: Option<Option<String>>,
    pub role: Option<Role>,
}

impl SessionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    #[must_use]
    pub fn with_room_code(mut self, room_code: impl Into<String>) -> Self {
        self.room_code = Some(Some(room_code.into()));
        self
    }

    #[must_use]
    pub fn without_room_code(mut self) -> Self {
        self.room_code = Some(None);
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    fn apply_to(self, identity: &mut SessionIdentity) {
        if let Some(display_name) = self.display_name {
            identity.display_name = display_name;
        }
        if let Some(room_code) = self.room_code {
            identity.room_code = room_code;
        }
        if let Some(role) = self.role {
            identity.role = role;
        }
    }
}

// ── Storage & clock seams ───────────────────────────────────────────

/// Persistent storage for the serialized session record.
pub trait SessionStore: Send + Sync {
    /// Load the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Storage`] or [`LobbyError::Io`] when the backend fails.
    fn load(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Storage`] or [`LobbyError::Io`] when the backend fails.
    fn save(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the value under `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::Storage`] or [`LobbyError::Io`] when the backend fails.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.entries).remove(key);
        Ok(())
    }
}

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl SessionStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LobbyError::Io(e)),
        }
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LobbyError::Io(e)),
        }
    }
}

/// Source of the timestamps stamped onto the session record.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ── Options ─────────────────────────────────────────────────────────

/// Construction options for [`LocalSessionCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Key of the single stored record.
    pub storage_key: String,
    /// Age after which the record is purged on read.
    pub stale_after: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

// ── Subscriptions ───────────────────────────────────────────────────

type Listener = Arc<dyn Fn(&SessionIdentity) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Handle returned by [`LocalSessionCache::subscribe`].
///
/// The listener stays registered until this handle is dropped or
/// [`unsubscribe`](Subscription::unsubscribe) is called.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ── Cache ───────────────────────────────────────────────────────────

/// Several patches applied as one logical update. See [`LocalSessionCache::batch`].
pub struct SessionBatch<'a> {
    identity: &'a mut SessionIdentity,
    changed: bool,
}

impl SessionBatch<'_> {
    pub fn set(&mut self, patch: SessionPatch) {
        patch.apply_to(self.identity);
        self.changed = true;
    }

    pub fn identity(&self) -> &SessionIdentity {
        self.identity
    }
}

/// Durable key/value cache of the local [`SessionIdentity`].
pub struct LocalSessionCache {
    options: CacheOptions,
    store: Box<dyn SessionStore>,
    clock: Box<dyn Clock>,
    identity: Mutex<SessionIdentity>,
    listeners: Arc<Mutex<Listeners>>,
}

impl LocalSessionCache {
    /// Open a cache backed by `store`, loading any previously saved record.
    pub fn open(store: impl SessionStore + 'static, options: CacheOptions) -> Self {
        Self::open_with_clock(store, options, SystemClock)
    }

    /// Like [`open`](Self::open) with an explicit clock.
    pub fn open_with_clock(
        store: impl SessionStore + 'static,
        options: CacheOptions,
        clock: impl Clock + 'static,
    ) -> Self {
        let identity = load_record(&store, &options.storage_key);
        Self {
            options,
            store: Box::new(store),
            clock: Box::new(clock),
            identity: Mutex::new(identity),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// A cache with no durable backing.
    pub fn in_memory() -> Self {
        Self::open(MemoryStore::new(), CacheOptions::default())
    }

    /// Current identity. A record older than the staleness window is purged
    /// first (which notifies subscribers like [`clear`](Self::clear)).
    pub fn get(&self) -> SessionIdentity {
        let purged = {
            let mut identity = lock(&self.identity);
            if !self.is_stale(&identity) {
                return identity.clone();
            }
            debug!(
                last_updated = ?identity.last_updated,
                "session record is stale, purging"
            );
            *identity = SessionIdentity::default();
            self.remove_record();
            identity.clone()
        };
        self.notify(&purged);
        purged
    }

    /// Merge `patch` into the cached identity, stamp it, persist it and
    /// notify subscribers.
    pub fn set(&self, patch: SessionPatch) -> SessionIdentity {
        self.batch(|tx| tx.set(patch))
    }

    /// Apply several patches and notify subscribers once.
    ///
    /// The closure must not call back into this cache.
    pub fn batch(&self, f: impl FnOnce(&mut SessionBatch<'_>)) -> SessionIdentity {
        let updated = {
            let mut identity = lock(&self.identity);
            let mut tx = SessionBatch {
                identity: &mut *identity,
                changed: false,
            };
            f(&mut tx);
            if !tx.changed {
                return identity.clone();
            }
            identity.last_updated = Some(self.clock.now());
            self.persist(&identity);
            identity.clone()
        };
        self.notify(&updated);
        updated
    }

    /// Reset to the default identity and delete the stored record.
    pub fn clear(&self) -> SessionIdentity {
        let cleared = {
            let mut identity = lock(&self.identity);
            *identity = SessionIdentity::default();
            self.remove_record();
            identity.clone()
        };
        self.notify(&cleared);
        cleared
    }

    /// Register a listener invoked synchronously after every change.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SessionIdentity) + Send + Sync + 'static,
    ) -> Subscription {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn is_stale(&self, identity: &SessionIdentity) -> bool {
        let Some(last_updated) = identity.last_updated else {
            return false;
        };
        // A timestamp in the future (clock skew) is treated as fresh.
        (self.clock.now() - last_updated)
            .to_std()
            .is_ok_and(|age| age > self.options.stale_after)
    }

    fn persist(&self, identity: &SessionIdentity) {
        let result = serde_json::to_string(identity)
            .map_err(LobbyError::from)
            .and_then(|json| self.store.save(&self.options.storage_key, &json));
        if let Err(e) = result {
            error!("failed to persist session record: {e}");
        }
    }

    fn remove_record(&self) {
        if let Err(e) = self.store.remove(&self.options.storage_key) {
            error!("failed to remove session record: {e}");
        }
    }

    fn notify(&self, identity: &SessionIdentity) {
        // Snapshot the listeners so a callback may subscribe/unsubscribe.
        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(identity);
        }
    }
}

impl std::fmt::Debug for LocalSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSessionCache")
            .field("storage_key", &self.options.storage_key)
            .field("identity", &*lock(&self.identity))
            .field("listeners", &lock(&self.listeners).entries.len())
            .finish()
    }
}

fn load_record(store: &dyn SessionStore, key: &str) -> SessionIdentity {
    match store.load(key) {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("ignoring unreadable session record: {e}");
                SessionIdentity::default()
            }
        },
        Ok(None) => SessionIdentity::default(),
        Err(e) => {
            error!("failed to load session record: {e}");
            SessionIdentity::default()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
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
    use chrono::TimeZone;

    #[derive(Clone)]
    struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        fn starting_at(at: DateTime<Utc>) -> Self {
            Self(Arc::new(Mutex::new(at)))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::TimeDelta::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn set_merges_and_stamps() {
        let clock = ManualClock::starting_at(epoch());
        let cache =
            LocalSessionCache::open_with_clock(MemoryStore::new(), CacheOptions::new(), clock);

        cache.set(SessionPatch::new().with_display_name("Ash"));
        let identity = cache.set(SessionPatch::new().with_role(Role::Host));

        assert_eq!(identity.display_name, "Ash");
        assert_eq!(identity.role, Role::Host);
        assert_eq!(identity.last_updated, Some(epoch()));
        assert_eq!(cache.get(), identity);
    }

    #[test]
    fn without_room_code_clears_only_the_code() {
        let cache = LocalSessionCache::in_memory();
        cache.set(
            SessionPatch::new()
                .with_display_name("Misty")
                .with_room_code("AB12CD"),
        );
        let identity = cache.set(SessionPatch::new().without_room_code());
        assert!(identity.room_code.is_none());
        assert_eq!(identity.display_name, "Misty");
    }

    #[test]
    fn record_survives_reopen() {
        let store = MemoryStore::new();
        let cache = LocalSessionCache::open(store.clone(), CacheOptions::new());
        cache.set(
            SessionPatch::new()
                .with_display_name("Ash")
                .with_room_code("AB12CD")
                .with_role(Role::Host),
        );

        let reopened = LocalSessionCache::open(store.clone(), CacheOptions::new());
        let identity = reopened.get();
        assert_eq!(identity.display_name, "Ash");
        assert_eq!(identity.room_code.as_deref(), Some("AB12CD"));
        assert_eq!(identity.role, Role::Host);

        let raw = store.load(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["roomCode"], "AB12CD");
        assert_eq!(value["displayName"], "Ash");
        assert_eq!(value["role"], "Host");
        assert!(value["lastUpdated"].is_string());
    }

    #[test]
    fn stale_record_is_purged_on_get() {
        let clock = ManualClock::starting_at(epoch());
        let store = MemoryStore::new();
        let cache =
            LocalSessionCache::open_with_clock(store.clone(), CacheOptions::new(), clock.clone());
        cache.set(SessionPatch::new().with_display_name("Ash"));

        clock.advance(Duration::from_secs(30 * 60));
        assert_eq!(cache.get().display_name, "Ash");

        clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(cache.get(), SessionIdentity::default());
        assert!(store.load(DEFAULT_STORAGE_KEY).unwrap().is_none());
    }

    #[test]
    fn subscribers_are_notified_in_call_order() {
        let cache = LocalSessionCache::in_memory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = cache.subscribe(move |identity| {
            sink.lock().unwrap().push(identity.display_name.clone());
        });

        cache.set(SessionPatch::new().with_display_name("first"));
        cache.set(SessionPatch::new().with_display_name("second"));
        cache.clear();

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", ""]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let cache = LocalSessionCache::in_memory();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let sub = cache.subscribe(move |_| *counter.lock().unwrap() += 1);

        cache.set(SessionPatch::new().with_display_name("Ash"));
        sub.unsubscribe();
        cache.set(SessionPatch::new().with_display_name("Brock"));

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn batch_coalesces_notifications() {
        let cache = LocalSessionCache::in_memory();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let _sub = cache.subscribe(move |_| *counter.lock().unwrap() += 1);

        let identity = cache.batch(|tx| {
            tx.set(SessionPatch::new().with_display_name("Ash"));
            tx.set(SessionPatch::new().with_role(Role::Host));
            tx.set(SessionPatch::new().with_room_code("AB12CD"));
        });

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(identity.room_code.as_deref(), Some("AB12CD"));
    }

    #[test]
    fn empty_batch_does_not_notify() {
        let cache = LocalSessionCache::in_memory();
        let count = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&count);
        let _sub = cache.subscribe(move |_| *counter.lock().unwrap() += 1);

        cache.batch(|_| {});
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn corrupt_record_is_ignored() {
        let store = MemoryStore::new();
        store.save(DEFAULT_STORAGE_KEY, "{not json").unwrap();
        let cache = LocalSessionCache::open(store, CacheOptions::new());
        assert_eq!(cache.get(), SessionIdentity::default());
    }

    #[test]
    fn file_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let options = CacheOptions::new().with_storage_key("lobby");
        let cache = LocalSessionCache::open(FileStore::new(dir.path()), options.clone());
        cache.set(SessionPatch::new().with_display_name("Ash"));
        assert!(dir.path().join("lobby.json").is_file());

        let reopened = LocalSessionCache::open(FileStore::new(dir.path()), options);
        assert_eq!(reopened.get().display_name, "Ash");

        reopened.clear();
        assert!(!dir.path().join("lobby.json").exists());
    }
}
