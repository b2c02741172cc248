//! The json messages exchanged between clients and relays.
//!
//! Every message is a json array whose first element names the message:
//!
//! Client to relay:
//!  * `["EVENT", <event>]` publishes a record.
//!  * `["REQ", <sub id>, <filter>...]` opens a subscription.
//!  * `["CLOSE", <sub id>]` closes a subscription.
//!  * `["AUTH", <event>]` answers an authentication challenge.
//!  * `["COUNT", <sub id>, <filter>...]` asks for the number of matching records.
//!
//! Relay to client:
//!  * `["EVENT", <sub id>, <event>]` a record matching a subscription.
//!  * `["OK", <event id>, <accepted>, <message>]` the outcome of a publish.
//!  * `["EOSE", <sub id>]` all stored records of a subscription were sent.
//!  * `["CLOSED", <sub id>, <message>]` the relay closed a subscription.
//!  * `["NOTICE", <message>]` a human readable message.
//!  * `["AUTH", <challenge>]` an authentication challenge.
//!  * `["COUNT", <sub id>, {"count": <n>}]` the answer to a count request.

use std::{fmt, sync::Arc};

use murmur_base::{Event, EventId, Filter};
use serde::{
    Deserialize, Serialize, Serializer,
    ser::{SerializeMap, SerializeSeq},
};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

/// Prefix of relay messages rejecting a request because authentication is missing.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

/// Prefix of relay messages rejecting a request of an authenticated client.
pub const RESTRICTED_PREFIX: &str = "restricted:";

/// The identifier of a subscription on a single connection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display, derive_more::Debug)]
#[debug("SubscriptionId({_0})")]
pub struct SubscriptionId(Arc<str>);

impl SubscriptionId {
    /// Creates a subscription id from a string.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for SubscriptionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SubscriptionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

/// Error decoding a protocol message.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ProtocolError {
    #[snafu(display("message is not valid json"))]
    Json { source: serde_json::Error },
    #[snafu(display("message is not a non-empty json array"))]
    NotAnArray {},
    #[snafu(display("unknown message type: {name}"))]
    UnknownMessage { name: String },
    #[snafu(display("{name} message is missing element {index}"))]
    MissingElement { name: &'static str, index: usize },
    #[snafu(display("{name} message has an invalid element {index}"))]
    InvalidElement {
        name: &'static str,
        index: usize,
        source: serde_json::Error,
    },
}

/// A message sent from a client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Publishes a record.
    Event(Box<Event>),
    /// Opens a subscription.
    Req {
        /// The subscription id, unique on the connection.
        id: SubscriptionId,
        /// Filters, combined disjunctively.
        filters: Vec<Filter>,
    },
    /// Closes a subscription.
    Close(SubscriptionId),
    /// Answers an authentication challenge.
    Auth(Box<Event>),
    /// Requests the number of matching records.
    Count {
        /// The request id, unique on the connection.
        id: SubscriptionId,
        /// Filters, combined disjunctively.
        filters: Vec<Filter>,
    },
}

/// A message sent from a relay to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// A record for a subscription.
    Event {
        /// The subscription the record matched.
        subscription: SubscriptionId,
        /// The record, not yet verified.
        event: Box<Event>,
    },
    /// The outcome of publishing a record.
    Ok {
        /// The id of the published record.
        event_id: EventId,
        /// Whether the relay accepted the record.
        accepted: bool,
        /// A machine readable prefix followed by a human readable message.
        message: String,
    },
    /// End of stored records for a subscription.
    EndOfStoredEvents(SubscriptionId),
    /// The relay closed a subscription.
    Closed {
        /// The closed subscription.
        subscription: SubscriptionId,
        /// Why the subscription was closed.
        message: String,
    },
    /// A human readable message.
    Notice(String),
    /// An authentication challenge.
    Auth {
        /// The challenge string to sign.
        challenge: String,
    },
    /// The answer to a count request.
    Count {
        /// The count request id.
        subscription: SubscriptionId,
        /// The number of matching records.
        count: u64,
    },
}

impl ClientMessage {
    /// Encodes the message as json text.
    pub fn to_json(&self) -> String {
        // Serialising records, filters and strings to a `String` can not fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes a message from json text.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let (name, parts) = split_message(json)?;
        match name.as_str() {
            "EVENT" => Ok(Self::Event(Box::new(element(&parts, "EVENT", 1)?))),
            "REQ" => Ok(Self::Req {
                id: element(&parts, "REQ", 1)?,
                filters: trailing_filters(&parts, "REQ")?,
            }),
            "CLOSE" => Ok(Self::Close(element(&parts, "CLOSE", 1)?)),
            "AUTH" => Ok(Self::Auth(Box::new(element(&parts, "AUTH", 1)?))),
            "COUNT" => Ok(Self::Count {
                id: element(&parts, "COUNT", 1)?,
                filters: trailing_filters(&parts, "COUNT")?,
            }),
            _ => UnknownMessageSnafu { name }.fail(),
        }
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        match self {
            Self::Event(event) => {
                seq.serialize_element("EVENT")?;
                seq.serialize_element(event)?;
            }
            Self::Req { id, filters } => {
                seq.serialize_element("REQ")?;
                seq.serialize_element(id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
            }
            Self::Close(id) => {
                seq.serialize_element("CLOSE")?;
                seq.serialize_element(id)?;
            }
            Self::Auth(event) => {
                seq.serialize_element("AUTH")?;
                seq.serialize_element(event)?;
            }
            Self::Count { id, filters } => {
                seq.serialize_element("COUNT")?;
                seq.serialize_element(id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
            }
        }
        seq.end()
    }
}

impl RelayMessage {
    /// Encodes the message as json text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decodes a message from json text.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let (name, parts) = split_message(json)?;
        match name.as_str() {
            "EVENT" => Ok(Self::Event {
                subscription: element(&parts, "EVENT", 1)?,
                event: Box::new(element(&parts, "EVENT", 2)?),
            }),
            "OK" => Ok(Self::Ok {
                event_id: element(&parts, "OK", 1)?,
                accepted: element(&parts, "OK", 2)?,
                message: optional_element(&parts, "OK", 3)?.unwrap_or_default(),
            }),
            "EOSE" => Ok(Self::EndOfStoredEvents(element(&parts, "EOSE", 1)?)),
            "CLOSED" => Ok(Self::Closed {
                subscription: element(&parts, "CLOSED", 1)?,
                message: optional_element(&parts, "CLOSED", 2)?.unwrap_or_default(),
            }),
            "NOTICE" => Ok(Self::Notice(element(&parts, "NOTICE", 1)?)),
            "AUTH" => Ok(Self::Auth {
                challenge: element(&parts, "AUTH", 1)?,
            }),
            "COUNT" => {
                #[derive(Deserialize)]
                struct CountBody {
                    count: u64,
                }
                let body: CountBody = element(&parts, "COUNT", 2)?;
                Ok(Self::Count {
                    subscription: element(&parts, "COUNT", 1)?,
                    count: body.count,
                })
            }
            _ => UnknownMessageSnafu { name }.fail(),
        }
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(None)?;
        match self {
            Self::Event {
                subscription,
                event,
            } => {
                seq.serialize_element("EVENT")?;
                seq.serialize_element(subscription)?;
                seq.serialize_element(event)?;
            }
            Self::Ok {
                event_id,
                accepted,
                message,
            } => {
                seq.serialize_element("OK")?;
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
            }
            Self::EndOfStoredEvents(subscription) => {
                seq.serialize_element("EOSE")?;
                seq.serialize_element(subscription)?;
            }
            Self::Closed {
                subscription,
                message,
            } => {
                seq.serialize_element("CLOSED")?;
                seq.serialize_element(subscription)?;
                seq.serialize_element(message)?;
            }
            Self::Notice(message) => {
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
            }
            Self::Auth { challenge } => {
                seq.serialize_element("AUTH")?;
                seq.serialize_element(challenge)?;
            }
            Self::Count {
                subscription,
                count,
            } => {
                seq.serialize_element("COUNT")?;
                seq.serialize_element(subscription)?;
                seq.serialize_element(&CountBody(*count))?;
            }
        }
        seq.end()
    }
}

struct CountBody(u64);

impl Serialize for CountBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("count", &self.0)?;
        map.end()
    }
}

impl fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(event) => write!(f, "EVENT {}", event.id.fmt_short()),
            Self::Req { id, filters } => write!(f, "REQ {id} ({} filters)", filters.len()),
            Self::Close(id) => write!(f, "CLOSE {id}"),
            Self::Auth(event) => write!(f, "AUTH {}", event.id.fmt_short()),
            Self::Count { id, filters } => write!(f, "COUNT {id} ({} filters)", filters.len()),
        }
    }
}

fn split_message(json: &str) -> Result<(String, Vec<Value>), ProtocolError> {
    let value: Value = serde_json::from_str(json).context(JsonSnafu)?;
    let Value::Array(parts) = value else {
        return NotAnArraySnafu.fail();
    };
    let name = parts
        .first()
        .and_then(Value::as_str)
        .context(NotAnArraySnafu)?
        .to_string();
    Ok((name, parts))
}

fn element<T: serde::de::DeserializeOwned>(
    parts: &[Value],
    name: &'static str,
    index: usize,
) -> Result<T, ProtocolError> {
    optional_element(parts, name, index)?.context(MissingElementSnafu { name, index })
}

fn optional_element<T: serde::de::DeserializeOwned>(
    parts: &[Value],
    name: &'static str,
    index: usize,
) -> Result<Option<T>, ProtocolError> {
    parts
        .get(index)
        .map(|value| T::deserialize(value).context(InvalidElementSnafu { name, index }))
        .transpose()
}

fn trailing_filters(parts: &[Value], name: &'static str) -> Result<Vec<Filter>, ProtocolError> {
    parts
        .iter()
        .enumerate()
        .skip(2)
        .map(|(index, value)| Filter::deserialize(value).context(InvalidElementSnafu { name, index }))
        .collect()
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn message_name() -> impl Strategy<Value = &'static str> {
        prop_oneof![
            Just("EVENT"),
            Just("OK"),
            Just("EOSE"),
            Just("CLOSED"),
            Just("NOTICE"),
            Just("AUTH"),
            Just("COUNT"),
            Just("REQ"),
        ]
    }

    fn element() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            any::<bool>().prop_map(serde_json::Value::from),
            any::<u32>().prop_map(serde_json::Value::from),
            "[a-z0-9:]{0,16}".prop_map(serde_json::Value::from),
            Just(serde_json::json!({})),
            Just(serde_json::json!({"count": 3})),
        ]
    }

    proptest! {
        #[test]
        fn decoding_never_panics(name in message_name(), rest in prop::collection::vec(element(), 0..4)) {
            let mut array = vec![serde_json::Value::from(name)];
            array.extend(rest);
            let json = serde_json::Value::Array(array).to_string();
            let _ = RelayMessage::from_json(&json);
            let _ = ClientMessage::from_json(&json);
        }

        #[test]
        fn garbage_is_rejected(text in "\\PC{0,64}") {
            if let Ok(msg) = RelayMessage::from_json(&text) {
                // Anything accepted must encode back to an equivalent message.
                prop_assert_eq!(RelayMessage::from_json(&msg.to_json()).unwrap(), msg);
            }
        }
    }
}
