//! Messaging session: connection lifecycle, subscriptions and tracked delivery

pub mod engine;
pub mod events;
pub mod router;
pub mod state;
pub mod tracker;

pub use engine::{Session, DEFAULT_EVENT_CAPACITY};
pub use events::{EventStream, InboundEvent, InboundMessage};
pub use router::{Handler, SubscriptionHandle, TopicRouter};
pub use state::{
    ConnectionEvent, ConnectionState, ConnectionStateMachine, ReconnectConfig,
    ReconnectionDecision, Transition,
};
pub use tracker::{DeliveryHandle, DeliveryOutcome, DeliveryTracker, RetryPolicy};
