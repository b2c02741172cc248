//! Record kinds.

use serde::{Deserialize, Serialize};

/// The integer category of a record.
///
/// The kind decides which reducers apply to a record and how relays store it: regular
/// records are kept, replaceable ones only keep the latest per author, addressable ones the
/// latest per author and `d` identifier, ephemeral ones are never stored.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::Debug,
    derive_more::From,
)]
#[serde(transparent)]
#[debug("Kind({_0})")]
pub struct Kind(u16);

impl Kind {
    /// User profile metadata.
    pub const METADATA: Kind = Kind(0);
    /// A short text note.
    pub const TEXT_NOTE: Kind = Kind(1);
    /// The follow list of an author.
    pub const CONTACTS: Kind = Kind(3);
    /// A request to delete earlier records.
    pub const DELETION: Kind = Kind(5);
    /// A repost of another record.
    pub const REPOST: Kind = Kind(6);
    /// A reaction to another record.
    pub const REACTION: Kind = Kind(7);
    /// Creates a public chat channel.
    pub const CHANNEL_CREATE: Kind = Kind(40);
    /// Updates a public chat channel's metadata.
    pub const CHANNEL_METADATA: Kind = Kind(41);
    /// A message in a public chat channel.
    pub const CHANNEL_MESSAGE: Kind = Kind(42);
    /// Attaches labels to records or authors.
    pub const LABEL: Kind = Kind(1985);
    /// The list of relays an author reads from and writes to.
    pub const RELAY_LIST: Kind = Kind(10002);
    /// Client authentication against a relay.
    pub const AUTH: Kind = Kind(22242);
    /// Application specific settings.
    pub const APP_DATA: Kind = Kind(30078);

    /// Creates a kind from its integer value.
    pub const fn new(kind: u16) -> Self {
        Self(kind)
    }

    /// The integer value of this kind.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Whether relays only keep the latest record per author for this kind.
    pub fn is_replaceable(&self) -> bool {
        matches!(self.0, 0 | 3 | 10_000..20_000)
    }

    /// Whether relays only keep the latest record per author and identifier.
    pub fn is_addressable(&self) -> bool {
        matches!(self.0, 30_000..40_000)
    }

    /// Whether relays forward but never store records of this kind.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.0, 20_000..30_000)
    }
}
