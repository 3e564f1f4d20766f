//! Delivery tracking for QoS 1 and QoS 2 publishes
//!
//! Every tracked publish owns a packet id until it is acknowledged or fails
//! terminally. The tracker itself does no I/O: it hands back the publishes
//! that need to go on the wire and the supervisor sends them.

use crate::config::DeliverySection;
use crate::error::PublishError;
use crate::protocol::Message;
use crate::transport::OutboundPublish;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type DeliveryOutcome = Result<(), PublishError>;

/// Retry and capacity limits for tracked deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_interval: Duration,
    /// Retransmissions allowed after the first send
    pub max_retries: u32,
    pub max_in_flight: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            max_retries: 5,
            max_in_flight: 1024,
        }
    }
}

impl From<&DeliverySection> for RetryPolicy {
    fn from(section: &DeliverySection) -> Self {
        Self {
            retry_interval: Duration::from_millis(section.retry_interval_ms),
            max_retries: section.max_retries,
            max_in_flight: section.max_in_flight,
        }
    }
}

/// Resolves exactly once with the final delivery outcome
#[derive(Debug)]
pub struct DeliveryHandle {
    packet_id: Option<u16>,
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryHandle {
    pub(crate) fn channel(packet_id: Option<u16>) -> (DeliveryCompleter, Self) {
        let (tx, rx) = oneshot::channel();
        (DeliveryCompleter(tx), Self { packet_id, rx })
    }

    /// Packet id for tracked publishes, None for QoS 0
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    pub async fn outcome(self) -> DeliveryOutcome {
        self.rx.await.unwrap_or(Err(PublishError::NotConnected))
    }

    /// Non-blocking check; None while still pending
    pub fn try_outcome(&mut self) -> Option<DeliveryOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PublishError::NotConnected)),
        }
    }
}

#[derive(Debug)]
pub(crate) struct DeliveryCompleter(oneshot::Sender<DeliveryOutcome>);

impl DeliveryCompleter {
    pub(crate) fn complete(self, outcome: DeliveryOutcome) {
        // The caller may have dropped its handle
        let _ = self.0.send(outcome);
    }
}

#[derive(Debug)]
pub struct PendingDelivery {
    pub packet_id: u16,
    pub message: Message,
    pub created: Instant,
    pub first_sent: Option<Instant>,
    /// Last time it went on the wire on the current connection
    pub last_sent: Option<Instant>,
    pub retry_count: u32,
    sequence: u64,
    completer: Option<DeliveryCompleter>,
}

impl PendingDelivery {
    fn resolve(mut self, outcome: DeliveryOutcome) {
        if let Some(completer) = self.completer.take() {
            completer.complete(outcome);
        }
    }

    fn to_outbound(&self, dup: bool) -> OutboundPublish {
        OutboundPublish {
            packet_id: Some(self.packet_id),
            message: self.message.clone(),
            dup,
        }
    }
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub resend: Vec<OutboundPublish>,
    pub failed: Vec<(u16, PublishError)>,
}

/// In-flight QoS >= 1 deliveries keyed by packet id
#[derive(Debug)]
pub struct DeliveryTracker {
    pending: HashMap<u16, PendingDelivery>,
    next_packet_id: u16,
    next_sequence: u64,
    policy: RetryPolicy,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl DeliveryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            pending: HashMap::new(),
            next_packet_id: 1,
            next_sequence: 0,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.pending.contains_key(&packet_id)
    }

    pub fn get(&self, packet_id: u16) -> Option<&PendingDelivery> {
        self.pending.get(&packet_id)
    }

    /// Outstanding packet ids in publish order
    pub fn packet_ids(&self) -> Vec<u16> {
        self.ordered_ids()
    }

    /// Next free id in 1..=65535, skipping ids still outstanding
    fn allocate_packet_id(&mut self) -> Option<u16> {
        if self.pending.len() >= usize::from(u16::MAX) {
            return None;
        }

        loop {
            let candidate = self.next_packet_id;
            self.next_packet_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.pending.contains_key(&candidate) {
                return Some(candidate);
            }
        }
    }

    pub fn track(
        &mut self,
        message: Message,
        now: Instant,
    ) -> Result<(u16, DeliveryHandle), PublishError> {
        if !message.qos.is_tracked() {
            return Err(PublishError::Untracked);
        }

        let limit = self.policy.max_in_flight.min(usize::from(u16::MAX));
        if self.pending.len() >= limit {
            return Err(PublishError::TooManyInFlight { limit });
        }

        let packet_id = self
            .allocate_packet_id()
            .ok_or(PublishError::TooManyInFlight { limit })?;
        let (completer, handle) = DeliveryHandle::channel(Some(packet_id));

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        debug!(packet_id, topic = %message.topic, qos = ?message.qos, "Tracking delivery");
        self.pending.insert(
            packet_id,
            PendingDelivery {
                packet_id,
                message,
                created: now,
                first_sent: None,
                last_sent: None,
                retry_count: 0,
                sequence,
                completer: Some(completer),
            },
        );

        Ok((packet_id, handle))
    }

    /// Mark a tracked delivery as sent, unless something already sent it
    pub fn claim_for_send(&mut self, packet_id: u16, now: Instant) -> Option<OutboundPublish> {
        let entry = self.pending.get_mut(&packet_id)?;
        if entry.last_sent.is_some() {
            return None;
        }

        let dup = entry.first_sent.is_some();
        entry.first_sent.get_or_insert(now);
        entry.last_sent = Some(now);
        Some(entry.to_outbound(dup))
    }

    /// Everything outstanding, in publish order, marked as sent
    pub fn take_for_resend(&mut self, now: Instant) -> Vec<OutboundPublish> {
        let ids = self.ordered_ids();
        let mut resend = Vec::with_capacity(ids.len());

        for packet_id in ids {
            if let Some(entry) = self.pending.get_mut(&packet_id) {
                let dup = entry.first_sent.is_some();
                entry.first_sent.get_or_insert(now);
                entry.last_sent = Some(now);
                resend.push(entry.to_outbound(dup));
            }
        }

        resend
    }

    /// Forget wire state after losing the connection
    pub fn mark_unsent_all(&mut self) {
        for entry in self.pending.values_mut() {
            entry.last_sent = None;
        }
    }

    pub fn acknowledge(&mut self, packet_id: u16) -> bool {
        match self.pending.remove(&packet_id) {
            Some(entry) => {
                debug!(packet_id, retries = entry.retry_count, "Delivery acknowledged");
                entry.resolve(Ok(()));
                true
            }
            None => {
                debug!(packet_id, "Ignoring acknowledgment for unknown packet id");
                false
            }
        }
    }

    /// Retry scan: resend stale deliveries, fail the ones out of retries
    pub fn on_tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();

        for packet_id in self.ordered_ids() {
            let Some(entry) = self.pending.get_mut(&packet_id) else {
                continue;
            };
            let Some(last_sent) = entry.last_sent else {
                continue;
            };
            if now.saturating_duration_since(last_sent) < self.policy.retry_interval {
                continue;
            }

            if entry.retry_count >= self.policy.max_retries {
                let error = PublishError::DeliveryTimeout {
                    packet_id,
                    attempts: entry.retry_count + 1,
                };
                if let Some(entry) = self.pending.remove(&packet_id) {
                    warn!(packet_id, topic = %entry.message.topic, "Delivery timed out");
                    entry.resolve(Err(error.clone()));
                }
                outcome.failed.push((packet_id, error));
            } else {
                entry.retry_count += 1;
                entry.last_sent = Some(now);
                debug!(packet_id, retry = entry.retry_count, "Retransmitting delivery");
                outcome.resend.push(entry.to_outbound(true));
            }
        }

        outcome
    }

    /// Resolve one delivery with `error` and release its packet id
    pub fn fail(&mut self, packet_id: u16, error: PublishError) -> bool {
        match self.pending.remove(&packet_id) {
            Some(entry) => {
                entry.resolve(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolve every outstanding delivery with `error`
    pub fn fail_all(&mut self, error: PublishError) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            entry.resolve(Err(error.clone()));
        }
        count
    }

    fn ordered_ids(&self) -> Vec<u16> {
        let mut entries: Vec<(u64, u16)> = self
            .pending
            .values()
            .map(|entry| (entry.sequence, entry.packet_id))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, packet_id)| packet_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn message(topic: &str, qos: QoS) -> Message {
        Message::new(topic, "payload", qos, false)
    }

    fn policy(retry_ms: u64, max_retries: u32, max_in_flight: usize) -> RetryPolicy {
        RetryPolicy {
            retry_interval: Duration::from_millis(retry_ms),
            max_retries,
            max_in_flight,
        }
    }

    #[test]
    fn test_qos0_is_never_tracked() {
        let mut tracker = DeliveryTracker::default();
        let result = tracker.track(message("a", QoS::AtMostOnce), Instant::now());
        assert!(matches!(result, Err(PublishError::Untracked)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_packet_ids_are_unique_and_nonzero() {
        let mut tracker = DeliveryTracker::default();
        let now = Instant::now();
        let (first, _h1) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        let (second, _h2) = tracker.track(message("a", QoS::ExactlyOnce), now).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_packet_id_wraps_and_skips_outstanding() {
        let mut tracker = DeliveryTracker::default();
        tracker.next_packet_id = u16::MAX;
        let now = Instant::now();

        let (last, _h1) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        assert_eq!(last, u16::MAX);

        tracker.next_packet_id = u16::MAX;
        let (wrapped, _h2) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn test_in_flight_limit() {
        let mut tracker = DeliveryTracker::new(policy(1000, 3, 2));
        let now = Instant::now();
        let _h1 = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        let _h2 = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        assert_eq!(
            tracker
                .track(message("a", QoS::AtLeastOnce), now)
                .unwrap_err(),
            PublishError::TooManyInFlight { limit: 2 }
        );
    }

    #[tokio::test]
    async fn test_acknowledge_resolves_handle() {
        let mut tracker = DeliveryTracker::default();
        let (id, handle) = tracker
            .track(message("a", QoS::AtLeastOnce), Instant::now())
            .unwrap();

        assert!(tracker.acknowledge(id));
        assert!(!tracker.acknowledge(id), "duplicate acks are ignored");
        assert_eq!(handle.outcome().await, Ok(()));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_claim_only_once() {
        let mut tracker = DeliveryTracker::default();
        let now = Instant::now();
        let (id, _handle) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();

        let first = tracker.claim_for_send(id, now).unwrap();
        assert!(!first.dup);
        assert!(tracker.claim_for_send(id, now).is_none());
        assert!(tracker.claim_for_send(999, now).is_none());
    }

    #[test]
    fn test_resend_preserves_publish_order_and_sets_dup() {
        let mut tracker = DeliveryTracker::default();
        let now = Instant::now();
        tracker.next_packet_id = 65534;
        let (a, _ha) = tracker.track(message("t/a", QoS::AtLeastOnce), now).unwrap();
        let (b, _hb) = tracker.track(message("t/b", QoS::AtLeastOnce), now).unwrap();
        let (c, _hc) = tracker.track(message("t/c", QoS::ExactlyOnce), now).unwrap();
        assert_eq!((a, b, c), (65534, 65535, 1));

        tracker.claim_for_send(a, now);
        tracker.mark_unsent_all();

        let resend = tracker.take_for_resend(now);
        let topics: Vec<&str> = resend.iter().map(|p| p.message.topic.as_str()).collect();
        assert_eq!(topics, vec!["t/a", "t/b", "t/c"]);
        assert!(resend[0].dup);
        assert!(!resend[1].dup);
        assert!(!resend[2].dup);

        // A racing publish command must not send it again
        assert!(tracker.claim_for_send(b, now).is_none());
    }

    #[tokio::test]
    async fn test_tick_retries_then_times_out() {
        let mut tracker = DeliveryTracker::new(policy(100, 2, 16));
        let start = Instant::now();
        let (id, handle) = tracker.track(message("a", QoS::AtLeastOnce), start).unwrap();
        tracker.claim_for_send(id, start);

        let early = tracker.on_tick(start + Duration::from_millis(50));
        assert!(early.resend.is_empty());

        let first = tracker.on_tick(start + Duration::from_millis(100));
        assert_eq!(first.resend.len(), 1);
        assert!(first.resend[0].dup);
        assert_eq!(tracker.get(id).unwrap().retry_count, 1);

        let second = tracker.on_tick(start + Duration::from_millis(200));
        assert_eq!(second.resend.len(), 1);

        let third = tracker.on_tick(start + Duration::from_millis(300));
        assert!(third.resend.is_empty());
        assert_eq!(third.failed.len(), 1);
        assert!(tracker.is_empty());

        assert_eq!(
            handle.outcome().await,
            Err(PublishError::DeliveryTimeout {
                packet_id: id,
                attempts: 3
            })
        );
    }

    #[test]
    fn test_unsent_entries_are_not_retried_by_tick() {
        let mut tracker = DeliveryTracker::new(policy(10, 0, 16));
        let now = Instant::now();
        let (_id, _handle) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();

        let outcome = tracker.on_tick(now + Duration::from_secs(60));
        assert!(outcome.resend.is_empty());
        assert!(outcome.failed.is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_resolves_everything() {
        let mut tracker = DeliveryTracker::default();
        let now = Instant::now();
        let (_, h1) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        let (_, h2) = tracker.track(message("b", QoS::ExactlyOnce), now).unwrap();

        assert_eq!(tracker.fail_all(PublishError::NotConnected), 2);
        assert!(tracker.is_empty());
        assert_eq!(h1.outcome().await, Err(PublishError::NotConnected));
        assert_eq!(h2.outcome().await, Err(PublishError::NotConnected));
    }

    #[tokio::test]
    async fn test_fail_releases_one_packet_id() {
        let mut tracker = DeliveryTracker::default();
        let now = Instant::now();
        let (a, ha) = tracker.track(message("a", QoS::AtLeastOnce), now).unwrap();
        let (b, _hb) = tracker.track(message("b", QoS::AtLeastOnce), now).unwrap();

        assert!(tracker.fail(a, PublishError::NotConnected));
        assert!(!tracker.fail(a, PublishError::NotConnected));
        assert_eq!(tracker.packet_ids(), vec![b]);
        assert_eq!(ha.outcome().await, Err(PublishError::NotConnected));
    }

    #[test]
    fn test_try_outcome() {
        let mut tracker = DeliveryTracker::default();
        let (id, mut handle) = tracker
            .track(message("a", QoS::AtLeastOnce), Instant::now())
            .unwrap();
        assert_eq!(handle.packet_id(), Some(id));
        assert!(handle.try_outcome().is_none());
        tracker.acknowledge(id);
        assert_eq!(handle.try_outcome(), Some(Ok(())));
    }
}
