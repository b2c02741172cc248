//! The relay protocol as spoken by murmur clients.
//!
//! Relays are dumb servers storing signed records and serving them to subscriptions.  This
//! crate contains the json wire messages, the [`Transport`] used to dial relays and the
//! bookkeeping needed on each connection: which records were already received and how
//! healthy the connection is.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(murmur_docsrs, feature(doc_auto_cfg))]

#[cfg(feature = "websocket")]
pub mod client;
pub mod defaults;
pub mod protos;
pub mod quality;
mod seen;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use murmur_base::RelayUrl;

#[cfg(feature = "websocket")]
pub use self::client::WsTransport;
pub use self::{
    protos::message::{ClientMessage, ProtocolError, RelayMessage, SubscriptionId},
    quality::QualityTracker,
    seen::SeenCache,
    transport::{BoxFuture, Conn, Transport, TransportError},
};
