//! Record tags and addresses.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{Kind, PublicKey, key::KeyParsingError};

/// A single tag of a record: an ordered sequence of strings, the first being the tag name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Debug)]
#[serde(transparent)]
#[debug("{_0:?}")]
pub struct Tag(Vec<String>);

impl Tag {
    /// Creates a tag from its parts.
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// A tag referencing an event id, `["e", <id>]`.
    pub fn event(id: impl fmt::Display) -> Self {
        Self::new(["e".to_string(), id.to_string()])
    }

    /// A tag referencing an author, `["p", <pubkey>]`.
    pub fn pubkey(key: &PublicKey) -> Self {
        Self::new(["p".to_string(), key.to_string()])
    }

    /// A tag referencing an address, `["a", <kind:pubkey:identifier>]`.
    pub fn address(address: &Address) -> Self {
        Self::new(["a".to_string(), address.to_string()])
    }

    /// The identifier tag of addressable records, `["d", <identifier>]`.
    pub fn identifier(d: impl Into<String>) -> Self {
        Self::new(["d".to_string(), d.into()])
    }

    /// The tag name.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The first value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// All parts of the tag including its name.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Whether this tag has a single letter name, the ones relays index.
    pub fn single_letter(&self) -> Option<char> {
        let name = self.name()?;
        let mut chars = name.chars();
        let c = chars.next()?;
        match chars.next() {
            None if c.is_ascii_alphabetic() => Some(c),
            _ => None,
        }
    }
}

/// The address of a replaceable or addressable record: `kind:pubkey:identifier`.
///
/// Replaceable records use an empty identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// Kind of the addressed record.
    pub kind: Kind,
    /// Author of the addressed record.
    pub pubkey: PublicKey,
    /// Value of the `d` tag, empty for replaceable kinds.
    pub identifier: String,
}

impl Address {
    /// Creates a new address.
    pub fn new(kind: Kind, pubkey: PublicKey, identifier: impl Into<String>) -> Self {
        Self {
            kind,
            pubkey,
            identifier: identifier.into(),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.pubkey, self.identifier)
    }
}

/// Error parsing an [`Address`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AddressParseError {
    #[snafu(display("address is missing the {part} part"))]
    MissingPart { part: &'static str },
    #[snafu(display("invalid kind in address"))]
    InvalidKind { source: std::num::ParseIntError },
    #[snafu(display("invalid pubkey in address"))]
    InvalidPubkey { source: KeyParsingError },
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let kind = parts
            .next()
            .context(MissingPartSnafu { part: "kind" })?
            .parse::<u16>()
            .context(InvalidKindSnafu)?;
        let pubkey = parts
            .next()
            .context(MissingPartSnafu { part: "pubkey" })?
            .parse::<PublicKey>()
            .context(InvalidPubkeySnafu)?;
        let identifier = parts.next().unwrap_or_default();
        Ok(Self::new(Kind::new(kind), pubkey, identifier))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
