//! Base types and utilities for murmur: records, keys, filters and relay urls.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(murmur_docsrs, feature(doc_auto_cfg))]

mod event;
mod filter;
mod key;
mod kind;
mod relay_url;
mod tag;
mod timestamp;

pub use self::{
    event::{Event, EventError, EventId, EventTemplate, UnsignedEvent},
    filter::{Filter, TagFilters, matches_any},
    key::{KeyParsingError, PublicKey, SecretKey, Signature, SignatureError},
    kind::Kind,
    relay_url::{RelayUrl, RelayUrlParseError},
    tag::{Address, AddressParseError, Tag},
    timestamp::Timestamp,
};
