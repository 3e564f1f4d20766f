//! Test doubles for the broker transport and the HTTP collaborator
//!
//! Lets sessions be exercised end to end without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
