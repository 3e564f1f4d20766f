//! Topic router: subscription filters mapped to handlers
//!
//! Pure data structure. The session core looks up matching handlers under its
//! lock and invokes them after releasing it.

use crate::error::InvalidTopicFilter;
use crate::protocol::topics::{topic_matches, validate_topic_filter};
use crate::protocol::QoS;
use crate::session::events::InboundEvent;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Receives events for matching topics
pub trait Handler: Send + Sync {
    fn handle(&self, event: &InboundEvent);
}

impl<F> Handler for F
where
    F: Fn(&InboundEvent) + Send + Sync,
{
    fn handle(&self, event: &InboundEvent) {
        self(event)
    }
}

/// Identifies one registration; returned by `register`, consumed by `unregister`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    filter: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    qos: QoS,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("qos", &self.qos)
            .finish_non_exhaustive()
    }
}

fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Debug, Default)]
pub struct TopicRouter {
    subscriptions: Vec<Subscription>,
    next_id: u64,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `filter`; the same filter and handler pair maps to one handle
    pub fn register(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionHandle, InvalidTopicFilter> {
        validate_topic_filter(filter)?;

        if let Some(existing) = self
            .subscriptions
            .iter_mut()
            .find(|s| s.handle.filter == filter && same_handler(&s.handler, &handler))
        {
            existing.qos = existing.qos.max(qos);
            debug!(filter, id = existing.handle.id, "Subscription already registered");
            return Ok(existing.handle.clone());
        }

        self.next_id += 1;
        let handle = SubscriptionHandle {
            id: self.next_id,
            filter: filter.to_string(),
        };
        self.subscriptions.push(Subscription {
            handle: handle.clone(),
            qos,
            handler,
        });
        debug!(filter, id = handle.id, qos = ?qos, "Subscription registered");

        Ok(handle)
    }

    pub fn unregister(&mut self, handle: &SubscriptionHandle) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.handle != *handle);
        before != self.subscriptions.len()
    }

    /// Distinct handlers whose filter matches `topic`, in registration order
    pub fn matching_handlers(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
        for subscription in &self.subscriptions {
            if topic_matches(&subscription.handle.filter, topic)
                && !handlers.iter().any(|h| same_handler(h, &subscription.handler))
            {
                handlers.push(Arc::clone(&subscription.handler));
            }
        }
        handlers
    }

    /// Invoke every matching handler once; returns how many ran
    pub fn route(&self, topic: &str, event: &InboundEvent) -> usize {
        let handlers = self.matching_handlers(topic);
        for handler in &handlers {
            handler.handle(event);
        }
        handlers.len()
    }

    /// Distinct filters with the highest QoS any subscription asked for
    pub fn broker_filters(&self) -> Vec<(String, QoS)> {
        let mut filters: BTreeMap<&str, QoS> = BTreeMap::new();
        for subscription in &self.subscriptions {
            filters
                .entry(subscription.handle.filter.as_str())
                .and_modify(|qos| *qos = (*qos).max(subscription.qos))
                .or_insert(subscription.qos);
        }
        filters
            .into_iter()
            .map(|(filter, qos)| (filter.to_string(), qos))
            .collect()
    }

    /// QoS the broker should hold for `filter`, None once nobody uses it
    pub fn broker_qos(&self, filter: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|s| s.handle.filter == filter)
            .map(|s| s.qos)
            .max()
    }

    pub fn has_filter(&self, filter: &str) -> bool {
        self.subscriptions.iter().any(|s| s.handle.filter == filter)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }
}
