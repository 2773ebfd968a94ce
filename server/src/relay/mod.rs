//! Relay side of the broker: one resilient WebSocket client per relay, a
//! manager that routes commands by cube id, and the JSON wire protocol the
//! relays speak.

pub mod connection;
pub mod manager;
pub mod protocol;
