//! Device wire protocol: topic layout, ID validation and message payloads

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
