//! A client engine for open relay networks.
//!
//! Independent relays broadcast signed, immutable records.  The same record may arrive from
//! several relays, records arrive in no particular order, and any record can be stale by
//! the time it arrives.  murmur reduces this stream into a consistent, reactive local view
//! of mutable application state and publishes locally authored records back to relays.
//!
//! The pieces, leaf first:
//!
//! - The [`Pool`] keeps the relay connections, multiplexes subscriptions and publishes,
//!   validates and deduplicates inbound records.
//! - The [`Worker`] batches inbound records so bursts never starve the application.
//! - The [`Dispatcher`] routes each record to the projections interested in its kind.
//! - Projections reduce records into entities through the last-writer-wins
//!   [`reconcile`] module and keep them in reactive [`Store`]s, optionally bounded by a
//!   [`BoundedCache`] which keeps the local identity's social graph around.
//! - The [`Publisher`] signs and sends local records, echoing them into the pipeline.
//!
//! An [`Engine`] wires all of these together:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use murmur::{Engine, signer::LocalSigner};
//! use murmur_base::{EventTemplate, Kind, SecretKey};
//!
//! let engine = Engine::builder()
//!     .signer(LocalSigner::new(SecretKey::generate(&mut rand::rngs::OsRng)))
//!     .relays(["wss://relay.example.com".parse()?])
//!     .build()?;
//! let (event, progress) = engine
//!     .publish(EventTemplate::new(Kind::TEXT_NOTE, "hello"))
//!     .await?;
//! let report = progress.finish().await;
//! println!("{} accepted: {}", event.id, report.success());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(murmur_docsrs, feature(doc_auto_cfg))]

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod pool;
pub mod projections;
pub mod publish;
pub mod reconcile;
pub mod signer;
pub mod storage;
pub mod store;
mod util;
pub mod watchable;
pub mod worker;

pub use murmur_base::{Event, EventId, EventTemplate, Filter, Kind, PublicKey, RelayUrl, SecretKey};

pub use self::{
    cache::BoundedCache,
    config::Config,
    dispatch::{Dispatched, Dispatcher, Handler},
    engine::{Builder, Engine, EngineOptions},
    pool::Pool,
    publish::{PublishReport, Publisher},
    store::Store,
    worker::Worker,
};
