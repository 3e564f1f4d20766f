//! MQTT v5 transport on rumqttc
//!
//! - [`connection`]: option building and error classification (pure)
//! - [`message_handler`]: routing decisions for event loop events (pure)
//! - [`client`]: the [`MqttTransport`] that owns the event loop task
//!
//! ```rust,no_run
//! use devlink::config::SessionConfig;
//! use devlink::session::Session;
//! use devlink::transport::MqttTransport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new(MqttTransport::new());
//! session
//!     .connect(SessionConfig::new("mqtt://localhost:1883", "controller-1"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttTransport;
pub use connection::{classify_connection_error, configure_mqtt_options};
pub use message_handler::{EventRoute, MessageHandler};
