//! Protocols used by the relay client.

pub mod message;
