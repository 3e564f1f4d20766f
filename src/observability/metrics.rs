//! Per-session counters and connection health
//!
//! Each `Session` owns one `SessionMetrics`; counters are relaxed atomics
//! bumped from the supervisor and read through a serializable snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Messages older than this make a connected session look unhealthy
const STALE_AFTER_MS: i64 = 5 * 60 * 1000;

#[derive(Debug)]
pub struct SessionMetrics {
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnects: AtomicU64,
    state_transitions: AtomicU64,

    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    deliveries_acknowledged: AtomicU64,
    deliveries_retried: AtomicU64,
    deliveries_failed: AtomicU64,

    messages_received: AtomicU64,
    messages_malformed: AtomicU64,
    messages_unhandled: AtomicU64,

    /// Unix millis; 0 when unset
    connected_since: AtomicI64,
    last_message_at: AtomicI64,
    created_at: i64,
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            deliveries_acknowledged: AtomicU64::new(0),
            deliveries_retried: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_malformed: AtomicU64::new(0),
            messages_unhandled: AtomicU64::new(0),
            connected_since: AtomicI64::new(0),
            last_message_at: AtomicI64::new(0),
            created_at: now_ms(),
        }
    }

    pub fn connection_attempt(&self) {
        bump(&self.connection_attempts);
    }

    pub fn connection_established(&self, reconnect: bool) {
        bump(&self.connections_established);
        if reconnect {
            bump(&self.reconnects);
        }
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since.store(now_ms(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        bump(&self.connection_failures);
    }

    pub fn connection_lost(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.connected_since.store(0, Ordering::Relaxed);
    }

    pub fn state_transition(&self) {
        bump(&self.state_transitions);
    }

    pub fn message_published(&self) {
        bump(&self.messages_published);
    }

    pub fn publish_failed(&self) {
        bump(&self.publish_failures);
    }

    pub fn delivery_acknowledged(&self) {
        bump(&self.deliveries_acknowledged);
    }

    pub fn delivery_retried(&self) {
        bump(&self.deliveries_retried);
    }

    pub fn delivery_failed(&self) {
        bump(&self.deliveries_failed);
    }

    pub fn message_received(&self) {
        bump(&self.messages_received);
        self.last_message_at.store(now_ms(), Ordering::Relaxed);
    }

    pub fn message_malformed(&self) {
        bump(&self.messages_malformed);
    }

    pub fn message_unhandled(&self) {
        bump(&self.messages_unhandled);
    }

    pub fn snapshot(&self, pending_deliveries: usize) -> MetricsSnapshot {
        let now = now_ms();
        let connected = self.connected.load(Ordering::Relaxed);
        let since = self.connected_since.load(Ordering::Relaxed);
        let last_message = self.last_message_at.load(Ordering::Relaxed);

        let uptime_ms = (connected && since > 0).then(|| (now - since).max(0) as u64);
        let since_last_message_ms = (last_message > 0).then(|| (now - last_message).max(0) as u64);
        let reconnects = self.reconnects.load(Ordering::Relaxed);
        let is_healthy = determine_health_status(uptime_ms, since_last_message_ms);

        MetricsSnapshot {
            connected,
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            reconnects,
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            deliveries_acknowledged: self.deliveries_acknowledged.load(Ordering::Relaxed),
            deliveries_retried: self.deliveries_retried.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            pending_deliveries,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_malformed: self.messages_malformed.load(Ordering::Relaxed),
            messages_unhandled: self.messages_unhandled.load(Ordering::Relaxed),
            uptime_ms,
            since_last_message_ms,
            session_age_ms: (now - self.created_at).max(0) as u64,
            is_healthy,
            quality: assess_connection_quality(is_healthy, reconnects, uptime_ms),
        }
    }
}

fn determine_health_status(uptime_ms: Option<u64>, since_last_message_ms: Option<u64>) -> bool {
    match (uptime_ms, since_last_message_ms) {
        (Some(_), None) => true,
        (Some(_), Some(last)) => last < STALE_AFTER_MS as u64,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

pub fn assess_connection_quality(
    is_healthy: bool,
    reconnects: u64,
    uptime_ms: Option<u64>,
) -> ConnectionQuality {
    const HOUR_MS: u64 = 3_600_000;

    if !is_healthy {
        return ConnectionQuality::Critical;
    }

    match (reconnects, uptime_ms) {
        (0, Some(uptime)) if uptime > HOUR_MS => ConnectionQuality::Excellent,
        (0, Some(_)) => ConnectionQuality::Good,
        (1..=2, Some(uptime)) if uptime > HOUR_MS / 2 => ConnectionQuality::Good,
        (1..=2, Some(_)) => ConnectionQuality::Fair,
        (3..=5, _) => ConnectionQuality::Fair,
        (6..=10, _) => ConnectionQuality::Poor,
        _ => ConnectionQuality::Critical,
    }
}

/// Point-in-time view of a session's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnects: u64,
    pub state_transitions: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub deliveries_acknowledged: u64,
    pub deliveries_retried: u64,
    pub deliveries_failed: u64,
    pub pending_deliveries: usize,
    pub messages_received: u64,
    pub messages_malformed: u64,
    pub messages_unhandled: u64,
    pub uptime_ms: Option<u64>,
    pub since_last_message_ms: Option<u64>,
    pub session_age_ms: u64,
    pub is_healthy: bool,
    pub quality: ConnectionQuality,
}
