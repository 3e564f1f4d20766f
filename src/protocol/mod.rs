//! Device protocol: topics, message types and the payload codec

pub mod codec;
pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
