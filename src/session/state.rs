//! Connection state machine
//!
//! Owns the session's single `ConnectionState`. Every transition goes through
//! [`ConnectionStateMachine::apply`], which validates it against the
//! transition table, logs it, and publishes the new state on a watch channel.
//! Backoff and reconnection decisions are pure functions of the current state
//! and the [`ReconnectConfig`].

use crate::config::SessionConfig;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection attempt number, starting at 1
    Reconnecting(u32),
    Closing,
}

impl ConnectionState {
    /// Connecting, connected, or on the way back
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Inputs that drive state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    ConnAckReceived,
    /// A connect attempt failed; `fatal` failures are never retried
    ConnectFailed { reason: String, fatal: bool },
    TransportLost(String),
    CloseRequested,
    Closed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::ConnectRequested => write!(f, "connect requested"),
            ConnectionEvent::ConnAckReceived => write!(f, "connack received"),
            ConnectionEvent::ConnectFailed { reason, fatal } => {
                write!(f, "connect failed (fatal: {fatal}): {reason}")
            }
            ConnectionEvent::TransportLost(reason) => write!(f, "transport lost: {reason}"),
            ConnectionEvent::CloseRequested => write!(f, "close requested"),
            ConnectionEvent::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid transition from {from} on {event}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn from_session(config: &SessionConfig) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            initial_backoff: config.initial_reconnect_backoff(),
            max_backoff: config.max_reconnect_backoff(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Unjittered delay before attempt `attempt`: `initial * 2^(attempt-1)`, capped
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Backoff delay with jitter drawn from `[delay/2, delay]`
    pub fn jittered_backoff_delay(&self, attempt: u32) -> Duration {
        let entropy = Uuid::new_v4().as_u128() as u64;
        apply_jitter(self.calculate_backoff_delay(attempt), entropy)
    }

    /// Upper bound on total backoff time; None for unlimited retries
    pub fn calculate_max_total_time(&self) -> Option<Duration> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }
}

/// Map `entropy` onto `[delay/2, delay]`
pub fn apply_jitter(delay: Duration, entropy: u64) -> Duration {
    let total = delay.as_millis().min(u128::from(u64::MAX)) as u64;
    let floor = total / 2;
    let span = total - floor;
    Duration::from_millis(floor + entropy % (span + 1))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
    AbortNotReconnecting,
}

/// Validates, applies and broadcasts connection state transitions
pub struct ConnectionStateMachine {
    state: ConnectionState,
    config: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    transitions: u64,
}

impl ConnectionStateMachine {
    pub fn new(config: ReconnectConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            config,
            state_tx,
            transitions: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Replace the reconnect policy; only meaningful while disconnected
    pub fn reconfigure(&mut self, config: ReconnectConfig) {
        self.config = config;
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Transition table (pure function)
    pub fn next_state(
        current: ConnectionState,
        event: &ConnectionEvent,
        config: &ReconnectConfig,
    ) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let next = match (current, event) {
            (S::Closing, E::CloseRequested) => S::Closing,
            (S::Closing, E::Closed) => S::Disconnected,
            (S::Closing, _) => return Err(invalid(current, event)),
            (_, E::CloseRequested) => S::Closing,

            (S::Disconnected, E::ConnectRequested) => S::Connecting,
            (S::Connecting | S::Reconnecting(_), E::ConnAckReceived) => S::Connected,

            (S::Connecting | S::Reconnecting(_), E::ConnectFailed { fatal: true, .. }) => {
                S::Disconnected
            }
            (S::Connecting, E::ConnectFailed { fatal: false, .. }) => {
                if config.auto_reconnect {
                    S::Reconnecting(1)
                } else {
                    S::Disconnected
                }
            }
            (S::Reconnecting(attempt), E::ConnectFailed { fatal: false, .. }) => {
                match config.max_attempts {
                    Some(max) if attempt >= max => S::Disconnected,
                    _ => S::Reconnecting(attempt.saturating_add(1)),
                }
            }
            (S::Connected, E::TransportLost(_)) => {
                if config.auto_reconnect {
                    S::Reconnecting(1)
                } else {
                    S::Disconnected
                }
            }

            _ => return Err(invalid(current, event)),
        };

        Ok(next)
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Result<Transition, InvalidTransition> {
        let from = self.state;
        let to = match Self::next_state(from, &event, &self.config) {
            Ok(to) => to,
            Err(err) => {
                warn!(state = %from, event = %event, "Rejected connection state transition");
                return Err(err);
            }
        };

        if from != to {
            self.state = to;
            self.transitions += 1;
            self.state_tx.send_replace(to);
            log_state_transition(from, to, &event);
        }

        Ok(Transition { from, to })
    }

    /// Whether the supervisor should back off and try again (pure function)
    pub fn should_attempt_reconnection(&self, shutdown_requested: bool) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        match self.state {
            ConnectionState::Reconnecting(attempt) => ReconnectionDecision::Proceed {
                attempt,
                delay: self.config.jittered_backoff_delay(attempt),
            },
            _ => ReconnectionDecision::AbortNotReconnecting,
        }
    }
}

fn invalid(from: ConnectionState, event: &ConnectionEvent) -> InvalidTransition {
    InvalidTransition {
        from,
        event: event.to_string(),
    }
}

fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
    match (from, to, event) {
        (ConnectionState::Connecting, ConnectionState::Connected, _) => {
            info!("Broker connection established");
        }
        (ConnectionState::Reconnecting(attempt), ConnectionState::Connected, _) => {
            info!(attempt, "Reconnection successful");
        }
        (ConnectionState::Connected, _, ConnectionEvent::TransportLost(reason)) => {
            warn!(%reason, next = %to, "Broker connection lost");
        }
        (_, ConnectionState::Reconnecting(attempt), ConnectionEvent::ConnectFailed { reason, .. }) => {
            warn!(attempt, %reason, "Connect attempt failed, will retry");
        }
        (_, ConnectionState::Disconnected, ConnectionEvent::ConnectFailed { reason, fatal }) => {
            error!(%reason, fatal, "Connection failed permanently");
        }
        _ => {
            debug!(from = %from, to = %to, "Connection state changed");
        }
    }
}
