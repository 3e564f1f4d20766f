//! Structured logging and per-session metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ConnectionQuality, MetricsSnapshot, SessionMetrics};

pub use logging::{mqtt_span, session_span};
