//! Automatic reconnection policy.
//!
//! A pure state machine: `Stable → Retrying(n) → GivenUp`. It decides what to
//! do after a channel is lost and leaves the actual timers and `open()` calls
//! to the session driver, so it can be tested without a clock.

use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::DisconnectReason;

/// Default number of automatic retries before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default delay before each automatic retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Where the policy currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyState {
    /// No loss outstanding.
    #[default]
    Stable,
    /// `n` automatic retries have been scheduled since the last stable channel.
    Retrying(u32),
    /// No more automatic retries; waiting for a manual reconnect.
    GivenUp,
}

/// How a lost channel should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Transport error, connect failure, timeout: worth retrying.
    Retryable,
    /// The server forced us out: never retried automatically.
    Forced,
}

/// Classify a channel close. `None` for closes we initiated ourselves.
pub fn classify(reason: &DisconnectReason) -> Option<DisconnectClass> {
    match reason {
        DisconnectReason::ConnectFailed(_) | DisconnectReason::Transport(_) => {
            Some(DisconnectClass::Retryable)
        }
        DisconnectReason::ClosedByServer => Some(DisconnectClass::Forced),
        DisconnectReason::ClientClosed => None,
    }
}

/// Delay before retry number `attempt` (1-based). Attempt 0 is immediate.
///
/// The delay is fixed: every automatic retry waits `base`.
pub fn backoff(attempt: u32, base: Duration) -> Duration {
    if attempt == 0 {
        Duration::ZERO
    } else {
        base
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Schedule one `open()` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Stop; surface "connection lost, retry manually".
    GiveUp,
    /// Nothing to do (already given up).
    Ignore,
}

/// Tunables for [`ReconnectionPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Decides when, and how many times, to re-open a lost channel.
#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    options: RetryOptions,
    state: PolicyState,
}

impl ReconnectionPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            state: PolicyState::Stable,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// A channel completed a full cycle: handshake, negotiation and the
    /// first snapshot answering it.
    pub fn on_connected(&mut self) {
        if self.state != PolicyState::Stable {
            debug!(previous = ?self.state, "reconnection policy back to stable");
        }
        self.state = PolicyState::Stable;
    }

    /// A channel was lost.
    pub fn on_disconnect(&mut self, class: DisconnectClass) -> PolicyDecision {
        let attempts = match self.state {
            PolicyState::GivenUp => return PolicyDecision::Ignore,
            PolicyState::Stable => 0,
            PolicyState::Retrying(n) => n,
        };

        if class == DisconnectClass::Forced {
            warn!("forced disconnect, not retrying");
            self.state = PolicyState::GivenUp;
            return PolicyDecision::GiveUp;
        }

        let attempt = attempts.saturating_add(1);
        if attempt > self.options.max_retries {
            warn!(
                max_retries = self.options.max_retries,
                "automatic retries exhausted"
            );
            self.state = PolicyState::GivenUp;
            return PolicyDecision::GiveUp;
        }

        self.state = PolicyState::Retrying(attempt);
        let delay = backoff(attempt, self.options.retry_delay);
        debug!(attempt, ?delay, "scheduling reconnect");
        PolicyDecision::Retry { attempt, delay }
    }

    /// The user asked to reconnect. Always resets the retry counter.
    pub fn manual_reconnect(&mut self) {
        debug!(previous = ?self.state, "manual reconnect");
        self.state = PolicyState::Stable;
    }

    /// Whether a retry scheduled as `attempt` is still wanted.
    pub fn is_pending(&self, attempt: u32) -> bool {
        self.state == PolicyState::Retrying(attempt)
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> ReconnectionPolicy {
        ReconnectionPolicy::new(RetryOptions {
            max_retries,
            retry_delay: Duration::from_millis(500),
        })
    }

    #[test]
    fn backoff_is_fixed_after_the_first_attempt() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff(0, base), Duration::ZERO);
        assert_eq!(backoff(1, base), base);
        assert_eq!(backoff(7, base), base);
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify(&DisconnectReason::Transport("reset".into())),
            Some(DisconnectClass::Retryable)
        );
        assert_eq!(
            classify(&DisconnectReason::ConnectFailed("timed out".into())),
            Some(DisconnectClass::Retryable)
        );
        assert_eq!(
            classify(&DisconnectReason::ClosedByServer),
            Some(DisconnectClass::Forced)
        );
        assert_eq!(classify(&DisconnectReason::ClientClosed), None);
    }

    #[test]
    fn retries_up_to_the_bound_then_gives_up() {
        let mut p = policy(2);
        assert_eq!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::Retry {
                attempt: 1,
                delay: Duration::from_millis(500)
            }
        );
        assert_eq!(p.state(), PolicyState::Retrying(1));
        assert!(matches!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::GiveUp
        );
        assert_eq!(p.state(), PolicyState::GivenUp);

        // No further automatic retries.
        assert_eq!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::Ignore
        );
        assert_eq!(p.state(), PolicyState::GivenUp);
    }

    #[test]
    fn forced_disconnect_gives_up_without_consuming_a_slot() {
        let mut p = policy(2);
        assert_eq!(p.on_disconnect(DisconnectClass::Forced), PolicyDecision::GiveUp);
        assert_eq!(p.state(), PolicyState::GivenUp);
    }

    #[test]
    fn manual_reconnect_resets_the_counter() {
        let mut p = policy(1);
        p.on_disconnect(DisconnectClass::Retryable);
        p.on_disconnect(DisconnectClass::Retryable);
        assert_eq!(p.state(), PolicyState::GivenUp);

        p.manual_reconnect();
        assert_eq!(p.state(), PolicyState::Stable);
        assert!(matches!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn negotiated_channel_returns_to_stable() {
        let mut p = policy(2);
        p.on_disconnect(DisconnectClass::Retryable);
        p.on_connected();
        assert_eq!(p.state(), PolicyState::Stable);
        assert!(matches!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::Retry { attempt: 1, .. }
        ));
    }

    #[test]
    fn zero_max_retries_gives_up_immediately() {
        let mut p = policy(0);
        assert_eq!(
            p.on_disconnect(DisconnectClass::Retryable),
            PolicyDecision::GiveUp
        );
    }

    #[test]
    fn pending_tracks_the_latest_attempt() {
        let mut p = policy(3);
        p.on_disconnect(DisconnectClass::Retryable);
        assert!(p.is_pending(1));
        p.on_disconnect(DisconnectClass::Retryable);
        assert!(!p.is_pending(1));
        assert!(p.is_pending(2));
    }
}
