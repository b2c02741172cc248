//! Signed, content addressed records.

use std::{fmt, str::FromStr};

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu, ensure};

use crate::{
    Address, Kind, PublicKey, SecretKey, Signature, Tag, Timestamp,
    key::{KeyParsingError, SignatureError, decode_hex},
};

/// The content hash identifying a record.
///
/// Two records with the same id are the same record, no matter which relay they came
/// from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId([u8; 32]);

impl EventId {
    /// Creates an id from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex string limited to the first 5 bytes.
    pub fn fmt_short(&self) -> String {
        HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        HEXLOWER.encode_write(&self.0, f)
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.fmt_short())
    }
}

impl FromStr for EventId {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hex::<32>(s).map(Self)
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error validating a record.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum EventError {
    #[snafu(display("event id does not match its content, expected {expected}"))]
    IdMismatch { expected: EventId },
    #[snafu(display("invalid event signature"))]
    InvalidSignature { source: SignatureError },
    #[snafu(display("malformed event json"))]
    Json { source: serde_json::Error },
}

/// A record as authored locally, before it has an author, a timestamp or a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// The kind of the record.
    pub kind: Kind,
    /// Tags of the record.
    pub tags: Vec<Tag>,
    /// The content of the record.
    pub content: String,
    /// Timestamp to use, defaults to the time of signing.
    pub created_at: Option<Timestamp>,
}

impl EventTemplate {
    /// Creates a template with no tags.
    pub fn new(kind: Kind, content: impl Into<String>) -> Self {
        Self {
            kind,
            tags: Vec::new(),
            content: content.into(),
            created_at: None,
        }
    }

    /// Adds a tag.
    pub fn tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Sets an explicit timestamp.
    pub fn created_at(mut self, created_at: Timestamp) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Stamps the author and the timestamp, computing the id.
    pub fn into_unsigned(self, pubkey: PublicKey) -> UnsignedEvent {
        let created_at = self.created_at.unwrap_or_else(Timestamp::now);
        let id = compute_id(
            &pubkey,
            created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        UnsignedEvent {
            id,
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// A record with its id computed, waiting for a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// The content hash.
    pub id: EventId,
    /// The author.
    pub pubkey: PublicKey,
    /// Self-reported creation time.
    pub created_at: Timestamp,
    /// The kind of the record.
    pub kind: Kind,
    /// Tags of the record.
    pub tags: Vec<Tag>,
    /// The content of the record.
    pub content: String,
}

impl UnsignedEvent {
    /// Signs the record.
    ///
    /// The key must belong to [`UnsignedEvent::pubkey`], otherwise the resulting record will
    /// fail verification.
    pub fn sign(self, key: &SecretKey) -> Event {
        let sig = key.sign(self.id.as_bytes());
        self.with_signature(sig)
    }

    /// Attaches a signature produced elsewhere, e.g. by a remote signer.
    pub fn with_signature(self, sig: Signature) -> Event {
        Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// An immutable, signed record received from or published to relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The content hash.
    pub id: EventId,
    /// The author.
    pub pubkey: PublicKey,
    /// Self-reported creation time.
    pub created_at: Timestamp,
    /// The kind of the record.
    pub kind: Kind,
    /// Tags of the record.
    pub tags: Vec<Tag>,
    /// The content of the record.
    pub content: String,
    /// Signature of the author over the id.
    pub sig: Signature,
}

impl Event {
    /// Parses a record from its json representation.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).context(JsonSnafu)
    }

    /// Checks that the id matches the content and that the signature is valid.
    pub fn verify(&self) -> Result<(), EventError> {
        self.verify_id()?;
        self.pubkey
            .verify(self.id.as_bytes(), &self.sig)
            .context(InvalidSignatureSnafu)
    }

    /// Checks only that the id matches the content.
    pub fn verify_id(&self) -> Result<(), EventError> {
        let expected = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        ensure!(expected == self.id, IdMismatchSnafu { expected });
        Ok(())
    }

    /// Iterates over the first values of all tags with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.name() == Some(name))
            .filter_map(|tag| tag.value())
    }

    /// The `d` identifier of the record, empty if absent.
    pub fn identifier(&self) -> &str {
        self.tag_values("d").next().unwrap_or_default()
    }

    /// The address of this record, if it is replaceable or addressable.
    pub fn address(&self) -> Option<Address> {
        if self.kind.is_replaceable() {
            Some(Address::new(self.kind, self.pubkey, ""))
        } else if self.kind.is_addressable() {
            Some(Address::new(self.kind, self.pubkey, self.identifier()))
        } else {
            None
        }
    }

    /// Whether this record tags the given author with a `p` tag.
    pub fn mentions(&self, pubkey: &PublicKey) -> bool {
        let hex = pubkey.to_string();
        self.tag_values("p").any(|value| value.eq_ignore_ascii_case(&hex))
    }
}

/// Hashes the canonical serialisation `[0, pubkey, created_at, kind, tags, content]`.
fn compute_id(
    pubkey: &PublicKey,
    created_at: Timestamp,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> EventId {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let hash = Sha256::digest(canonical.to_string().as_bytes());
    EventId(hash.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SecretKey {
        SecretKey::from_bytes(&[3u8; 32])
    }

    fn note(content: &str, created_at: u64) -> Event {
        EventTemplate::new(Kind::TEXT_NOTE, content)
            .tag(Tag::new(["t", "rust"]))
            .created_at(Timestamp::from_secs(created_at))
            .into_unsigned(key().public())
            .sign(&key())
    }

    #[test]
    fn test_sign_and_verify() {
        let event = note("hello", 100);
        event.verify().unwrap();
        assert_eq!(event.created_at.as_secs(), 100);
        assert_eq!(event.pubkey, key().public());
    }

    #[test]
    fn test_id_is_content_hash() {
        let a = note("hello", 100);
        let b = note("hello", 100);
        let c = note("hello", 101);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_tampered_content_is_rejected() {
        let mut event = note("hello", 100);
        event.content = "goodbye".into();
        assert!(matches!(event.verify(), Err(EventError::IdMismatch { .. })));
    }

    #[test]
    fn test_forged_signature_is_rejected() {
        let event = note("hello", 100);
        let other = SecretKey::from_bytes(&[4u8; 32]);
        let forged = Event {
            sig: other.sign(event.id.as_bytes()),
            ..event
        };
        assert!(matches!(
            forged.verify(),
            Err(EventError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let event = note("with \"quotes\"\nand newline", 42);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":1"#));
        assert!(json.contains(r#""created_at":42"#));
        let back = Event::from_json(&json).unwrap();
        assert_eq!(back, event);
        back.verify().unwrap();
    }

    #[test]
    fn test_address() {
        let key = key();
        let list = EventTemplate::new(Kind::new(30_001), "")
            .tag(Tag::identifier("bookmarks"))
            .into_unsigned(key.public())
            .sign(&key);
        let addr = list.address().unwrap();
        assert_eq!(addr.identifier, "bookmarks");
        assert_eq!(addr.kind, Kind::new(30_001));

        let profile = EventTemplate::new(Kind::METADATA, "{}")
            .into_unsigned(key.public())
            .sign(&key);
        assert_eq!(profile.address().unwrap().identifier, "");
        assert!(note("x", 1).address().is_none());
    }
}
