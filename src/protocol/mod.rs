//! Message model shared by every transport
//!
//! Rendezvous control messages and benchmark payloads both travel as
//! [`Message`]s: a JSON header frame followed by zero or more data frames.

mod messages;
mod payload;

pub use messages::*;
pub use payload::*;
