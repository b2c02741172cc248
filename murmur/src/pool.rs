//! The relay connection pool.
//!
//! The [`Pool`] owns all relay connections.  It is a handle to the [`RelayActor`] which
//! starts one [`ConnActor`] per relay in use:
//!
//! - Connections are opened on demand, the first time a relay is named by a call on the
//!   pool.  Opening a connection is asynchronous and may fail: failures only show up in the
//!   [`ConnectionInfo`] of the relay, the relay is re-dialed with exponential backoff.
//! - Every active relay keeps its subscriptions, pending publishes and count requests
//!   across reconnects and re-sends them whenever a connection is established.
//! - Identical filters on the same relay share a single `REQ`, no matter how many
//!   [`Subscription`]s asked for them.  Once the last listener is dropped the relay
//!   subscription is closed.
//! - Records received from a relay are validated, then forwarded to the listeners of their
//!   subscription.  The first time a record id is seen it is also queued on the [`Ingress`]
//!   channel, which feeds the engine.
//! - A periodic sweep recomputes the quality of each connection and closes connections
//!   which were idle for longer than [`PoolOptions::idle_timeout`].
//!
//! An unreachable relay never blocks the others: every relay is served by its own task.
//!
//! [`RelayActor`]: actor::RelayActor
//! [`ConnActor`]: conn::ConnActor

use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures_lite::{Stream, StreamExt};
use murmur_base::{Event, EventError, EventId, Filter, RelayUrl, Timestamp};
use murmur_relay::{SeenCache, Transport, defaults};
use snafu::{ResultExt, Snafu, ensure};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant, Sleep},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, info_span};

use self::actor::{PoolMessage, RelayActor};
use crate::{signer::Signer, watchable::Watcher};

mod conn;
mod actor;

/// Records entering the engine, each record id at most once.
pub type Ingress = mpsc::UnboundedReceiver<Arc<Event>>;

/// The socket state of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SocketStatus {
    /// Not yet dialed.
    New,
    /// Dialing, or waiting to dial again.
    Connecting,
    /// Connected.
    Open,
    /// Closed because it was idle, disconnected or the pool shut down.
    Closed,
    /// The last connection attempt failed or the connection was lost.
    Error,
}

/// The authentication state of a relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum AuthStatus {
    /// The relay did not ask for authentication.
    #[default]
    None,
    /// The relay asked for authentication.
    Requested,
    /// The authentication record is being signed.
    PendingSignature,
    /// The authentication record was sent, the relay did not answer yet.
    PendingResponse,
    /// The relay rejected the authentication.
    Denied,
    /// Authenticated, but the relay still refuses our requests.
    Forbidden,
    /// Authenticated.
    Authenticated,
}

/// A snapshot of the state of a relay connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// The relay.
    pub url: RelayUrl,
    /// The socket state.
    pub status: SocketStatus,
    /// The authentication state.
    pub auth: AuthStatus,
    /// When anything was last sent to or received from the relay.
    pub last_activity: Option<Instant>,
    /// The rolling quality score in `[0, 1]`, see [`murmur_relay::QualityTracker`].
    pub quality: f64,
    /// Whether the quality is below the threshold while the relay carries a subscription
    /// for the local identity.
    pub degraded: bool,
    /// The number of open relay subscriptions.
    pub subscriptions: usize,
}

impl ConnectionInfo {
    pub(crate) fn new(url: RelayUrl) -> Self {
        Self {
            url,
            status: SocketStatus::New,
            auth: AuthStatus::None,
            last_activity: None,
            quality: 1.0,
            degraded: false,
            subscriptions: 0,
        }
    }
}

/// A relay connection.
///
/// The connection is owned by the pool, this only observes it.  Once the pool closes the
/// connection, [`Connection::info`] returns `None`.
#[derive(Debug, Clone)]
pub struct Connection {
    url: RelayUrl,
    info: Watcher<ConnectionInfo>,
}

impl Connection {
    /// The relay url.
    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    /// The current state, `None` if the connection was closed.
    pub fn info(&self) -> Option<ConnectionInfo> {
        self.info.get().ok()
    }

    /// Watches the state of the connection.
    pub fn watch(&self) -> Watcher<ConnectionInfo> {
        self.info.clone()
    }
}

/// The outcome of publishing a record to a single relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The relay stored the record.
    Accepted,
    /// The relay refused the record.
    Rejected(String),
    /// The relay did not answer in time.
    Timeout,
}

impl RelayOutcome {
    /// Whether the relay accepted the record.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// An item of a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A record matching the filters.
    Event {
        /// The relay the record was received from.
        relay: RelayUrl,
        /// The validated record.
        event: Arc<Event>,
    },
    /// The relay sent all stored records.
    Eose {
        /// The relay.
        relay: RelayUrl,
    },
    /// The relay closed the subscription.
    Closed {
        /// The relay.
        relay: RelayUrl,
        /// The reason given by the relay.
        message: String,
    },
}

/// Options for the [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Whether to verify record ids and signatures on receipt.
    pub verify_signatures: bool,
    /// Records created further in the future than this are dropped.
    pub max_clock_skew: Duration,
    /// Connections without subscriptions or traffic for this long are closed.
    pub idle_timeout: Duration,
    /// Quality score below which connections are flagged as degraded.
    pub quality_threshold: f64,
    /// Time relays have to acknowledge a published record.
    pub publish_timeout: Duration,
    /// Interval of the sweep recomputing quality and closing idle connections.
    pub sweep_interval: Duration,
    /// Capacity of the cache of seen record ids, `0` disables deduplication.
    pub seen_cache_capacity: usize,
}

/// Default interval of the connection sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default bound on how far in the future a record may be created.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(900);

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            verify_signatures: true,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            idle_timeout: defaults::timeouts::INACTIVE_TIMEOUT,
            quality_threshold: defaults::DEFAULT_DEGRADED_THRESHOLD,
            publish_timeout: defaults::timeouts::PUBLISH_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            seen_cache_capacity: defaults::DEFAULT_SEEN_CACHE_CAPACITY,
        }
    }
}

impl PoolOptions {
    /// Checks a record against these options before it enters the engine.
    ///
    /// Verifies id and signature when enabled and rejects records created further in the
    /// future than [`PoolOptions::max_clock_skew`].
    pub fn check_record(&self, event: &Event) -> Result<(), InvalidRecord> {
        if self.verify_signatures {
            event.verify().context(InvalidSnafu)?;
        }
        let horizon = Timestamp::now().saturating_add(self.max_clock_skew);
        ensure!(
            event.created_at <= horizon,
            FromFutureSnafu {
                created_at: event.created_at,
            }
        );
        Ok(())
    }
}

/// Why a record was rejected, see [`PoolOptions::check_record`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum InvalidRecord {
    #[snafu(display("invalid record"))]
    Invalid { source: EventError },
    #[snafu(display("record created too far in the future ({created_at})"))]
    FromFuture { created_at: Timestamp },
}

/// The pool was shut down.
#[derive(Debug, Snafu)]
#[snafu(display("relay pool is shut down"))]
pub struct PoolClosed {}

/// Identifies the listener of a [`Subscription`] on the active relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ListenerId(u64);

/// The receiving end of a [`Subscription`], as registered on the active relays.
#[derive(Debug, Clone)]
pub(crate) struct Listener {
    pub(crate) id: ListenerId,
    pub(crate) tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

/// A handle to the relay connection pool.
///
/// Cheaply clonable.  The pool shuts down when the last clone is dropped or
/// [`Pool::shutdown`] is called.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    actor_tx: mpsc::Sender<PoolMessage>,
    cancel: CancellationToken,
    seen: SeenCache,
    options: PoolOptions,
    next_listener: AtomicU64,
    _task: AbortOnDropHandle<()>,
}

impl Pool {
    /// Starts the pool.
    ///
    /// Returns the pool and the channel on which all newly seen, validated records are
    /// delivered.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        options: PoolOptions,
    ) -> (Self, Ingress) {
        let (actor_tx, actor_rx) = mpsc::channel(256);
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let seen = SeenCache::new(options.seen_cache_capacity);
        let actor = RelayActor::new(
            transport,
            signer,
            options.clone(),
            seen.clone(),
            ingress_tx,
            cancel.clone(),
        );
        let task = tokio::spawn(actor.run(actor_rx).instrument(info_span!("pool")));
        let pool = Self {
            inner: Arc::new(PoolInner {
                actor_tx,
                cancel,
                seen,
                options,
                next_listener: AtomicU64::new(0),
                _task: AbortOnDropHandle::new(task),
            }),
        };
        (pool, ingress_rx)
    }

    /// The options the pool was started with.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Returns the connection to `url`, opening it if needed.
    pub async fn connection(&self, url: RelayUrl) -> Result<Connection, PoolClosed> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(PoolMessage::Connect {
            url: url.clone(),
            reply,
        })
        .await?;
        let info = reply_rx.await.map_err(|_| PoolClosed {})?;
        Ok(Connection { url, info })
    }

    /// Opens one logical subscription on all `urls`.
    ///
    /// Identical filters already open on a relay are shared.  Dropping the [`Subscription`]
    /// unsubscribes.  If the pool is shut down the subscription ends immediately.
    pub async fn subscribe(
        &self,
        urls: impl IntoIterator<Item = RelayUrl>,
        filters: Vec<Filter>,
    ) -> Subscription {
        let urls: Vec<RelayUrl> = urls
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        if !urls.is_empty() {
            self.send(PoolMessage::Subscribe {
                urls: urls.clone(),
                filters,
                listener: Listener { id, tx },
            })
            .await
            .ok();
        }
        Subscription {
            listener: id,
            relays: urls,
            rx,
            actor_tx: self.inner.actor_tx.clone(),
        }
    }

    /// Fetches stored records from all `urls`.
    ///
    /// Completes once every relay sent all its stored records, closed the subscription or
    /// the timeout elapsed, whichever comes first.  Records are deduplicated, a timeout
    /// returns whatever was received so far.
    pub async fn load(
        &self,
        urls: impl IntoIterator<Item = RelayUrl>,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Vec<Arc<Event>> {
        let mut sub = self.subscribe(urls, filters).await;
        let mut pending: BTreeSet<RelayUrl> = sub.relays().iter().cloned().collect();
        let mut events: BTreeMap<EventId, Arc<Event>> = BTreeMap::new();
        let collect = async {
            while !pending.is_empty() {
                let Some(item) = sub.next().await else {
                    break;
                };
                match item {
                    SubscriptionEvent::Event { event, .. } => {
                        events.entry(event.id).or_insert(event);
                    }
                    SubscriptionEvent::Eose { relay } | SubscriptionEvent::Closed { relay, .. } => {
                        pending.remove(&relay);
                    }
                }
            }
        };
        if time::timeout(timeout, collect).await.is_err() {
            debug!(?timeout, "load timed out, returning partial result");
        }
        let mut events: Vec<_> = events.into_values().collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        events
    }

    /// Asks all `urls` for the number of records matching `filters`.
    ///
    /// Returns the largest count reported by any relay within the timeout, or `None` if no
    /// relay answered.
    pub async fn count(
        &self,
        urls: impl IntoIterator<Item = RelayUrl>,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Option<u64> {
        let urls: BTreeSet<RelayUrl> = urls.into_iter().collect();
        if urls.is_empty() {
            return None;
        }
        let expected = urls.len();
        let (reply, mut reply_rx) = mpsc::unbounded_channel();
        self.send(PoolMessage::Count {
            urls: urls.into_iter().collect(),
            filters,
            reply,
        })
        .await
        .ok()?;
        let mut best: Option<u64> = None;
        let collect = async {
            let mut answered = 0;
            while answered < expected {
                let Some((_relay, count)) = reply_rx.recv().await else {
                    break;
                };
                answered += 1;
                best = best.max(Some(count));
            }
        };
        time::timeout(timeout, collect).await.ok();
        best
    }

    /// Publishes a record to all `urls`.
    ///
    /// The returned stream yields the outcome of every relay exactly once.  Relays which do
    /// not answer within [`PoolOptions::publish_timeout`] yield [`RelayOutcome::Timeout`].
    pub async fn publish(
        &self,
        urls: impl IntoIterator<Item = RelayUrl>,
        event: Arc<Event>,
    ) -> PublishOutcomes {
        let urls: BTreeSet<RelayUrl> = urls.into_iter().collect();
        let (reply, rx) = mpsc::unbounded_channel();
        if !urls.is_empty() {
            self.send(PoolMessage::Publish {
                urls: urls.iter().cloned().collect(),
                event,
                reply,
            })
            .await
            .ok();
        }
        PublishOutcomes {
            rx,
            remaining: urls,
            deadline: Box::pin(time::sleep(self.inner.options.publish_timeout)),
            expired: false,
        }
    }

    /// Returns a snapshot of all open connections.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let (reply, reply_rx) = oneshot::channel();
        if self.send(PoolMessage::Connections { reply }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Closes the connection to `url`.
    ///
    /// Listeners of subscriptions on this relay stop receiving records from it.
    pub async fn disconnect(&self, url: RelayUrl) {
        self.send(PoolMessage::Disconnect { url }).await.ok();
    }

    /// The relays a record was received from, as far as it is still remembered.
    pub fn seen_on(&self, id: &EventId) -> Vec<RelayUrl> {
        self.inner.seen.seen_on(id)
    }

    /// Closes all connections and stops the pool.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn send(&self, msg: PoolMessage) -> Result<(), PoolClosed> {
        self.inner
            .actor_tx
            .send(msg)
            .await
            .map_err(|_| PoolClosed {})
    }
}

/// A logical subscription on several relays.
///
/// A [`Stream`] of [`SubscriptionEvent`]s.  Dropping it unsubscribes from all relays,
/// records already received are not retracted.
#[derive(Debug)]
pub struct Subscription {
    listener: ListenerId,
    relays: Vec<RelayUrl>,
    rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    actor_tx: mpsc::Sender<PoolMessage>,
}

impl Subscription {
    /// The relays this subscription was opened on.
    pub fn relays(&self) -> &[RelayUrl] {
        &self.relays
    }
}

impl Stream for Subscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.relays.is_empty() {
            return;
        }
        // If the inbox is full the next sweep prunes the closed listener instead.
        self.actor_tx
            .try_send(PoolMessage::Unsubscribe {
                listener: self.listener,
            })
            .ok();
    }
}

/// The per-relay outcomes of a publish, see [`Pool::publish`].
#[derive(Debug)]
pub struct PublishOutcomes {
    rx: mpsc::UnboundedReceiver<(RelayUrl, RelayOutcome)>,
    remaining: BTreeSet<RelayUrl>,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
}

impl PublishOutcomes {
    /// The relays which did not answer yet.
    pub fn remaining(&self) -> impl Iterator<Item = &RelayUrl> {
        self.remaining.iter()
    }

    fn next_timeout(&mut self) -> Option<(RelayUrl, RelayOutcome)> {
        let url = self.remaining.pop_first()?;
        Some((url, RelayOutcome::Timeout))
    }
}

impl Stream for PublishOutcomes {
    type Item = (RelayUrl, RelayOutcome);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.remaining.is_empty() {
            return Poll::Ready(None);
        }
        if self.expired {
            return Poll::Ready(self.next_timeout());
        }
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some((url, outcome))) => {
                    if self.remaining.remove(&url) {
                        return Poll::Ready(Some((url, outcome)));
                    }
                }
                Poll::Ready(None) => {
                    // All relays dropped the request without answering.
                    self.expired = true;
                    return Poll::Ready(self.next_timeout());
                }
                Poll::Pending => break,
            }
        }
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.expired = true;
                Poll::Ready(self.next_timeout())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests;
