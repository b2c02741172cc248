//! Internal utilities to support testing.
//!
//! [`MemoryTransport`] connects to in-process [`MemoryRelay`]s.  Messages still travel as
//! json text, so tests exercise the same wire format as a websocket connection.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use murmur_base::{Event, Filter, Kind, PublicKey, RelayUrl, matches_any};
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, info_span, trace};

use crate::{
    protos::message::{
        AUTH_REQUIRED_PREFIX, ClientMessage, RelayMessage, SubscriptionId,
    },
    transport::{BoxFuture, Conn, Transport, TransportError},
};

/// How a [`MemoryRelay`] answers published records and subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Policy {
    /// Accept and store every valid record.
    #[default]
    Accept,
    /// Reject every record with the given message.
    Reject(String),
    /// Never answer publishes, subscriptions or counts.
    Silent,
}

/// A [`Transport`] connecting to [`MemoryRelay`]s.
///
/// Dialing a url without a registered relay fails as unreachable.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    relays: Arc<Mutex<BTreeMap<RelayUrl, MemoryRelay>>>,
}

impl MemoryTransport {
    /// Creates a transport without any relays.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new relay at `url`.
    pub fn add_relay(&self, url: &str) -> MemoryRelay {
        let url: RelayUrl = url.parse().expect("invalid relay url");
        let relay = MemoryRelay::new(url.clone());
        self.relays
            .lock()
            .expect("poisoned")
            .insert(url, relay.clone());
        relay
    }

    /// Returns the relay registered at `url`.
    pub fn relay(&self, url: &RelayUrl) -> Option<MemoryRelay> {
        self.relays.lock().expect("poisoned").get(url).cloned()
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, url: RelayUrl) -> BoxFuture<Result<Conn, TransportError>> {
        let relay = self.relay(&url);
        Box::pin(async move {
            let Some(relay) = relay else {
                return Err(TransportError::Unreachable {});
            };
            relay.accept()
        })
    }
}

/// An in-memory relay.
///
/// Stores accepted records and serves subscriptions, counts and authentication like a
/// real relay would.  Cheaply clonable, all clones share the same state.
#[derive(Debug, Clone)]
pub struct MemoryRelay {
    url: RelayUrl,
    state: Arc<Mutex<RelayState>>,
}

#[derive(Debug, Default)]
struct RelayState {
    reachable: bool,
    require_auth: bool,
    policy: Policy,
    latency: Duration,
    events: Vec<Event>,
    received: Vec<ClientMessage>,
    dials: usize,
    next_conn_id: u64,
    connections: BTreeMap<u64, ConnState>,
}

#[derive(Debug)]
struct ConnState {
    tx: mpsc::UnboundedSender<String>,
    subscriptions: BTreeMap<SubscriptionId, Vec<Filter>>,
    challenge: String,
    authenticated: Option<PublicKey>,
    _task: Option<AbortOnDropHandle<()>>,
}

impl ConnState {
    fn send(&self, msg: RelayMessage) {
        self.tx.send(msg.to_json()).ok();
    }
}

impl MemoryRelay {
    fn new(url: RelayUrl) -> Self {
        Self {
            url,
            state: Arc::new(Mutex::new(RelayState {
                reachable: true,
                ..Default::default()
            })),
        }
    }

    /// The url of this relay.
    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// Makes the relay unreachable, closing all its connections, or reachable again.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock().expect("poisoned");
        state.reachable = reachable;
        if !reachable {
            state.connections.clear();
        }
    }

    /// Sets how the relay answers.
    pub fn set_policy(&self, policy: Policy) {
        self.state.lock().expect("poisoned").policy = policy;
    }

    /// Delays handling every client message.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().expect("poisoned").latency = latency;
    }

    /// Requires clients to authenticate before publishing or subscribing.
    pub fn set_require_auth(&self, require_auth: bool) {
        self.state.lock().expect("poisoned").require_auth = require_auth;
    }

    /// Stores a record as if it was published by another client.
    ///
    /// Live subscriptions matching the record receive it.
    pub fn insert(&self, event: Event) {
        let mut state = self.state.lock().expect("poisoned");
        state.store(event);
    }

    /// All stored records.
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().expect("poisoned").events.clone()
    }

    /// All messages received from clients, in order.
    pub fn received(&self) -> Vec<ClientMessage> {
        self.state.lock().expect("poisoned").received.clone()
    }

    /// The number of `REQ` messages received.
    pub fn req_count(&self) -> usize {
        self.received()
            .iter()
            .filter(|msg| matches!(msg, ClientMessage::Req { .. }))
            .count()
    }

    /// The number of times a client connected.
    pub fn dial_count(&self) -> usize {
        self.state.lock().expect("poisoned").dials
    }

    /// The number of open connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().expect("poisoned").connections.len()
    }

    /// The number of open subscriptions over all connections.
    pub fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .expect("poisoned")
            .connections
            .values()
            .map(|conn| conn.subscriptions.len())
            .sum()
    }

    /// Closes all connections, clients will notice the connection was lost.
    pub fn disconnect_all(&self) {
        self.state.lock().expect("poisoned").connections.clear();
    }

    fn accept(&self) -> Result<Conn, TransportError> {
        let (client_tx, client_rx) = mpsc::unbounded_channel::<String>();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel::<String>();

        let conn_id = {
            let mut state = self.state.lock().expect("poisoned");
            if !state.reachable {
                return Err(TransportError::Unreachable {});
            }
            state.dials += 1;
            let conn_id = state.next_conn_id;
            state.next_conn_id += 1;
            let conn = ConnState {
                tx: relay_tx,
                subscriptions: BTreeMap::new(),
                challenge: format!("challenge-{conn_id}"),
                authenticated: None,
                _task: None,
            };
            if state.require_auth {
                conn.send(RelayMessage::Auth {
                    challenge: conn.challenge.clone(),
                });
            }
            state.connections.insert(conn_id, conn);
            conn_id
        };

        let task = tokio::spawn(
            self.clone()
                .serve(conn_id, client_rx)
                .instrument(info_span!("memory-relay", url = %self.url, conn_id)),
        );
        if let Some(conn) = self
            .state
            .lock()
            .expect("poisoned")
            .connections
            .get_mut(&conn_id)
        {
            conn._task = Some(AbortOnDropHandle::new(task));
        }

        let stream = futures_lite::stream::unfold(relay_rx, |mut rx| async move {
            let json = rx.recv().await?;
            let msg = RelayMessage::from_json(&json)
                .map_err(|source| TransportError::Protocol { source });
            Some((msg, rx))
        });
        let sink = futures_util::sink::unfold(client_tx, |tx, msg: ClientMessage| async move {
            tx.send(msg.to_json())
                .map_err(|_| TransportError::Closed {})?;
            Ok::<_, TransportError>(tx)
        });
        Ok(Conn::new(stream, sink))
    }

    async fn serve(self, conn_id: u64, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(json) = rx.recv().await {
            let msg = match ClientMessage::from_json(&json) {
                Ok(msg) => msg,
                Err(err) => {
                    debug!("invalid client message: {err:#}");
                    continue;
                }
            };
            trace!(%msg, "received");
            let latency = self.state.lock().expect("poisoned").latency;
            if !latency.is_zero() {
                time::sleep(latency).await;
            }
            let mut state = self.state.lock().expect("poisoned");
            state.handle(&self.url, conn_id, msg);
        }
        debug!("client closed connection");
        let removed = self
            .state
            .lock()
            .expect("poisoned")
            .connections
            .remove(&conn_id);
        if let Some(mut conn) = removed {
            // Do not abort the task we are running on.
            if let Some(task) = conn._task.take() {
                task.detach();
            }
        }
    }
}

impl RelayState {
    fn handle(&mut self, url: &RelayUrl, conn_id: u64, msg: ClientMessage) {
        self.received.push(msg.clone());
        let silent = self.policy == Policy::Silent;
        let require_auth = self.require_auth;
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        let unauthenticated = require_auth && conn.authenticated.is_none();

        match msg {
            ClientMessage::Event(event) => {
                if silent {
                    return;
                }
                let reply = |accepted: bool, message: String| RelayMessage::Ok {
                    event_id: event.id,
                    accepted,
                    message,
                };
                if unauthenticated {
                    conn.send(reply(false, format!("{AUTH_REQUIRED_PREFIX} please authenticate")));
                    return;
                }
                if let Err(err) = event.verify() {
                    conn.send(reply(false, format!("invalid: {err}")));
                    return;
                }
                if let Policy::Reject(message) = &self.policy {
                    conn.send(reply(false, message.clone()));
                    return;
                }
                conn.send(reply(true, String::new()));
                self.store(*event);
            }
            ClientMessage::Req { id, filters } => {
                if silent {
                    return;
                }
                if unauthenticated {
                    conn.send(RelayMessage::Closed {
                        subscription: id,
                        message: format!("{AUTH_REQUIRED_PREFIX} please authenticate"),
                    });
                    return;
                }
                for event in stored_matches(&self.events, &filters) {
                    conn.send(RelayMessage::Event {
                        subscription: id.clone(),
                        event: Box::new(event.clone()),
                    });
                }
                conn.send(RelayMessage::EndOfStoredEvents(id.clone()));
                conn.subscriptions.insert(id, filters);
            }
            ClientMessage::Close(id) => {
                conn.subscriptions.remove(&id);
            }
            ClientMessage::Auth(event) => {
                let challenge_ok = event.kind == Kind::AUTH
                    && event.tag_values("challenge").any(|c| c == conn.challenge)
                    && event
                        .tag_values("relay")
                        .any(|r| r.parse::<RelayUrl>().ok().as_ref() == Some(url));
                let accepted = challenge_ok && event.verify().is_ok();
                if accepted {
                    conn.authenticated = Some(event.pubkey);
                }
                let message = if accepted {
                    String::new()
                } else {
                    "invalid: bad auth event".to_string()
                };
                conn.send(RelayMessage::Ok {
                    event_id: event.id,
                    accepted,
                    message,
                });
            }
            ClientMessage::Count { id, filters } => {
                if silent {
                    return;
                }
                let count = self
                    .events
                    .iter()
                    .filter(|event| matches_any(&filters, event))
                    .count() as u64;
                conn.send(RelayMessage::Count {
                    subscription: id,
                    count,
                });
            }
        }
    }

    fn store(&mut self, event: Event) {
        if self.events.iter().any(|e| e.id == event.id) {
            return;
        }
        for conn in self.connections.values() {
            for (id, filters) in &conn.subscriptions {
                if matches_any(filters, &event) {
                    conn.send(RelayMessage::Event {
                        subscription: id.clone(),
                        event: Box::new(event.clone()),
                    });
                }
            }
        }
        self.events.push(event);
    }
}

/// Stored records matching the filters, newest first, honouring each filter's limit.
fn stored_matches<'a>(events: &'a [Event], filters: &[Filter]) -> Vec<&'a Event> {
    let mut sorted: Vec<&Event> = events.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let mut out: Vec<&Event> = Vec::new();
    for filter in filters {
        let matching = sorted.iter().filter(|event| filter.matches(event));
        let limited: Vec<&Event> = match filter.limit {
            Some(limit) => matching.take(limit).copied().collect(),
            None => matching.copied().collect(),
        };
        for event in limited {
            if !out.iter().any(|e| e.id == event.id) {
                out.push(event);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use futures_lite::StreamExt;
    use futures_util::SinkExt;
    use murmur_base::{EventTemplate, SecretKey, Tag, Timestamp};

    use super::*;

    fn note(key: &SecretKey, content: &str, created_at: u64) -> Event {
        EventTemplate::new(Kind::TEXT_NOTE, content)
            .created_at(Timestamp::from_secs(created_at))
            .into_unsigned(key.public())
            .sign(key)
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://memory.example.com");
        let key = SecretKey::from_bytes(&[1u8; 32]);
        relay.insert(note(&key, "stored", 10));

        let (mut stream, mut sink) = transport
            .connect(relay.url().clone())
            .await
            .unwrap()
            .split();

        let sub = SubscriptionId::new("s1");
        sink.send(ClientMessage::Req {
            id: sub.clone(),
            filters: vec![Filter::new().kind(Kind::TEXT_NOTE)],
        })
        .await
        .unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            RelayMessage::Event { .. }
        ));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            RelayMessage::EndOfStoredEvents(sub.clone())
        );

        let live = note(&key, "live", 20);
        sink.send(ClientMessage::Event(Box::new(live.clone())))
            .await
            .unwrap();
        let mut got_ok = false;
        let mut got_live = false;
        for _ in 0..2 {
            match stream.next().await.unwrap().unwrap() {
                RelayMessage::Ok { accepted, .. } => got_ok = accepted,
                RelayMessage::Event { event, .. } => got_live = event.id == live.id,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(got_ok && got_live);
        assert_eq!(relay.events().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let transport = MemoryTransport::new();
        let url: RelayUrl = "wss://nowhere.example.com".parse().unwrap();
        assert!(matches!(
            transport.connect(url).await,
            Err(TransportError::Unreachable { .. })
        ));

        let relay = transport.add_relay("wss://flaky.example.com");
        relay.set_reachable(false);
        assert!(transport.connect(relay.url().clone()).await.is_err());
        assert_eq!(relay.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://private.example.com");
        relay.set_require_auth(true);
        let key = SecretKey::from_bytes(&[2u8; 32]);

        let (mut stream, mut sink) = transport
            .connect(relay.url().clone())
            .await
            .unwrap()
            .split();
        let RelayMessage::Auth { challenge } = stream.next().await.unwrap().unwrap() else {
            panic!("expected challenge");
        };

        sink.send(ClientMessage::Req {
            id: SubscriptionId::new("s"),
            filters: vec![Filter::new()],
        })
        .await
        .unwrap();
        let RelayMessage::Closed { message, .. } = stream.next().await.unwrap().unwrap() else {
            panic!("expected closed");
        };
        assert!(message.starts_with(AUTH_REQUIRED_PREFIX));

        let auth = EventTemplate::new(Kind::AUTH, "")
            .tag(Tag::new(["relay", relay.url().as_str()]))
            .tag(Tag::new(["challenge", challenge.as_str()]))
            .into_unsigned(key.public())
            .sign(&key);
        sink.send(ClientMessage::Auth(Box::new(auth))).await.unwrap();
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            RelayMessage::Ok { accepted: true, .. }
        ));
    }

    #[test]
    fn test_stored_matches_limit_newest_first() {
        let key = SecretKey::from_bytes(&[3u8; 32]);
        let events: Vec<Event> = (0..5).map(|i| note(&key, "n", i)).collect();
        let out = stored_matches(&events, &[Filter::new().limit(2)]);
        let times: Vec<u64> = out.iter().map(|e| e.created_at.as_secs()).collect();
        assert_eq!(times, vec![4, 3]);
    }
}
