//! The actor handling a single relay connection.

use std::{
    collections::{BTreeMap, VecDeque, btree_map::Entry},
    future::Future,
    pin::pin,
    sync::Arc,
};

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};
use futures_lite::StreamExt;
use futures_util::SinkExt;
use murmur_base::{Event, EventId, EventTemplate, Filter, Kind, PublicKey, RelayUrl, Tag};
use murmur_relay::{
    BoxFuture, ClientMessage, Conn, RelayMessage, SeenCache, SubscriptionId, Transport,
    TransportError,
    defaults::timeouts::CONNECT_TIMEOUT,
    protos::message::{AUTH_REQUIRED_PREFIX, RESTRICTED_PREFIX},
    quality::{Exchange, ExchangeOutcome, QualityTracker},
    transport::ConnSink,
};
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, event, info_span, trace, warn};

use super::{
    AuthStatus, ConnectionInfo, Listener, ListenerId, PoolOptions, RelayOutcome, SocketStatus,
    SubscriptionEvent,
};
use crate::{
    signer::{Signer, SignerError},
    util::MaybeFuture,
    watchable::Watchable,
};

/// An actor which handles the connection to a single relay.
///
/// It is responsible for maintaining the connection to the relay and handling all
/// communication with it.  Subscriptions, publishes and count requests are kept in the
/// actor's state, not on the connection, so they survive reconnects.
///
/// The actor has 2 main states, each with its dedicated run loop:
///
/// - Dialing the relay.
///
///   This will continuously dial the relay until connected, using exponential backoff if
///   it can not connect.  Requests arriving meanwhile are recorded and sent once
///   connected.  See [`ConnActor::run_dialing`].
///
/// - Connected to the relay.
///
///   Sends all recorded requests, then handles new requests and the relay's answers.  See
///   [`ConnActor::run_connected`].
///
/// The actor shuts itself down on inactivity: when a sweep finds it without any
/// subscription or pending request and nothing was exchanged for the idle timeout.
#[derive(derive_more::Debug)]
pub(super) struct ConnActor {
    /// Inbox for requests from the [`RelayActor`](super::actor::RelayActor).
    inbox: mpsc::Receiver<ConnMessage>,
    /// Queue for newly seen records.
    ingress: mpsc::UnboundedSender<Arc<Event>>,

    /// The relay for this actor.
    url: RelayUrl,
    #[debug(skip)]
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    options: PoolOptions,
    seen: SeenCache,
    /// The published state of this connection.
    info: Watchable<ConnectionInfo>,
    /// Token indicating the [`ConnActor`] should stop.
    stop: CancellationToken,

    subscriptions: BTreeMap<SubscriptionId, RelaySubscription>,
    /// Open subscriptions by their filters, identical filters share one subscription.
    by_filters: BTreeMap<Vec<Filter>, SubscriptionId>,
    publishes: BTreeMap<EventId, PendingPublish>,
    counts: BTreeMap<SubscriptionId, PendingCount>,
    next_request_id: u64,

    /// Messages to send once connected, in order.
    outbox: VecDeque<ClientMessage>,
    connected: bool,
    quality: QualityTracker,
    degraded: bool,
    auth: AuthState,
    last_activity: Instant,
}

/// Requests for the [`ConnActor`].
#[derive(Debug)]
pub(super) enum ConnMessage {
    /// Adds a listener for records matching the filters.
    Subscribe {
        filters: Vec<Filter>,
        listener: Listener,
    },
    /// Removes a listener from all subscriptions.
    Unsubscribe(ListenerId),
    /// Publishes a record, answering on `reply`.
    Publish {
        event: Arc<Event>,
        reply: mpsc::UnboundedSender<(RelayUrl, RelayOutcome)>,
    },
    /// Counts matching records, answering on `reply`.
    Count {
        filters: Vec<Filter>,
        reply: mpsc::UnboundedSender<(RelayUrl, u64)>,
    },
    /// Recompute the quality and check for inactivity.
    Sweep,
}

/// Configuration needed to start an [`ConnActor`].
#[derive(Debug)]
pub(super) struct ConnOptions {
    pub(super) url: RelayUrl,
    pub(super) inbox: mpsc::Receiver<ConnMessage>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) signer: Arc<dyn Signer>,
    pub(super) options: PoolOptions,
    pub(super) seen: SeenCache,
    pub(super) ingress: mpsc::UnboundedSender<Arc<Event>>,
    pub(super) info: Watchable<ConnectionInfo>,
    pub(super) stop: CancellationToken,
}

/// Possible reasons for a failed relay connection.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
enum RelayConnectionError {
    #[snafu(display("failed to connect to relay"))]
    Dial { source: DialError },
    #[snafu(display("failed to handshake with relay"))]
    Handshake { source: RunError },
    #[snafu(display("lost connection to relay"))]
    Established { source: RunError },
}

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
enum RunError {
    #[snafu(display("stream closed by relay"))]
    StreamClosed {},
    #[snafu(display("relay stream read failed"))]
    StreamRead { source: TransportError },
    #[snafu(display("relay stream write failed"))]
    StreamWrite { source: TransportError },
}

#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
enum DialError {
    #[snafu(display("timeout (>{timeout:?}) trying to establish a connection"))]
    Timeout { timeout: Duration },
    #[snafu(display("unable to connect"))]
    Connect { source: TransportError },
}

/// A subscription on the relay, shared by all listeners with identical filters.
#[derive(Debug)]
struct RelaySubscription {
    filters: Vec<Filter>,
    listeners: BTreeMap<ListenerId, mpsc::UnboundedSender<SubscriptionEvent>>,
    /// Records received before the end of stored records, replayed to late listeners.
    stored: Vec<Arc<Event>>,
    eose: bool,
    /// Refused by the relay until we authenticate.
    awaiting_auth: bool,
}

impl RelaySubscription {
    fn new(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            listeners: BTreeMap::new(),
            stored: Vec::new(),
            eose: false,
            awaiting_auth: false,
        }
    }

    /// Sends to all listeners, forgetting those which went away.
    fn send(&mut self, item: SubscriptionEvent) {
        self.listeners
            .retain(|_, tx| tx.send(item.clone()).is_ok());
    }

    /// Adds a listener, catching it up with what the other listeners already received.
    fn add_listener(&mut self, url: &RelayUrl, listener: Listener) {
        for event in &self.stored {
            let item = SubscriptionEvent::Event {
                relay: url.clone(),
                event: event.clone(),
            };
            listener.tx.send(item).ok();
        }
        if self.eose {
            listener
                .tx
                .send(SubscriptionEvent::Eose { relay: url.clone() })
                .ok();
        }
        self.listeners.insert(listener.id, listener.tx);
    }

    fn mentions(&self, hex: &str, pubkey: &PublicKey) -> bool {
        self.filters.iter().any(|filter| {
            filter
                .authors
                .as_ref()
                .is_some_and(|authors| authors.contains(pubkey))
                || filter
                    .tags
                    .0
                    .get(&'p')
                    .is_some_and(|values| values.contains(hex))
        })
    }
}

#[derive(Debug)]
struct PendingPublish {
    event: Arc<Event>,
    replies: Vec<mpsc::UnboundedSender<(RelayUrl, RelayOutcome)>>,
    /// Refused by the relay until we authenticate.
    awaiting_auth: bool,
}

impl PendingPublish {
    fn resolve(self, url: &RelayUrl, outcome: RelayOutcome) {
        trace!(id = %self.event.id.fmt_short(), ?outcome, "publish resolved");
        for reply in self.replies {
            reply.send((url.clone(), outcome.clone())).ok();
        }
    }
}

#[derive(Debug)]
struct PendingCount {
    filters: Vec<Filter>,
    reply: mpsc::UnboundedSender<(RelayUrl, u64)>,
}

/// Authentication state of the current connection.
#[derive(Debug, Default)]
struct AuthState {
    status: AuthStatus,
    challenge: Option<String>,
    /// The authentication record awaiting the relay's `OK`.
    event_id: Option<EventId>,
}

impl ConnActor {
    pub(super) fn new(opts: ConnOptions) -> Self {
        let ConnOptions {
            url,
            inbox,
            transport,
            signer,
            options,
            seen,
            ingress,
            info,
            stop,
        } = opts;
        ConnActor {
            inbox,
            ingress,
            url,
            transport,
            signer,
            quality: QualityTracker::new(options.publish_timeout),
            options,
            seen,
            info,
            stop,
            subscriptions: BTreeMap::new(),
            by_filters: BTreeMap::new(),
            publishes: BTreeMap::new(),
            counts: BTreeMap::new(),
            next_request_id: 0,
            outbox: VecDeque::new(),
            connected: false,
            degraded: false,
            auth: AuthState::default(),
            last_activity: Instant::now(),
        }
    }

    /// The main actor run loop.
    ///
    /// Primarily switches between the dialing and connected states.
    pub(super) async fn run(mut self) {
        let mut backoff = Self::build_backoff();

        while let Err(err) = self.run_once().await {
            warn!("{err:#}");
            self.set_status(SocketStatus::Error);
            match err {
                RelayConnectionError::Dial { .. } | RelayConnectionError::Handshake { .. } => {
                    // If dialing failed, or if the relay connection failed before the relay
                    // answered anything, we wait an exponentially increasing time until we
                    // attempt to reconnect again.
                    self.quality.record(ExchangeOutcome::Failed);
                    let Some(delay) = backoff.next() else {
                        warn!("retries exceeded");
                        break;
                    };
                    debug!("retry in {delay:?}");
                    if !self.run_backoff(delay).await {
                        break;
                    }
                }
                RelayConnectionError::Established { .. } => {
                    // The connection worked for a while, reconnect immediately.
                    backoff = Self::build_backoff();
                }
            }
        }
        self.set_status(SocketStatus::Closed);
        debug!("exiting");
    }

    fn build_backoff() -> impl Backoff {
        ExponentialBuilder::new()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(16))
            .with_jitter()
            .without_max_times()
            .build()
    }

    /// Attempt to connect to the relay, and run the connected actor loop.
    ///
    /// Returns `Ok(())` if the actor loop should shut down. Returns an error if dialing failed,
    /// or if the relay connection failed while connected. In both cases, the connection should
    /// be retried with a backoff.
    async fn run_once(&mut self) -> Result<(), RelayConnectionError> {
        let conn = match self.run_dialing().instrument(info_span!("dialing")).await {
            Some(conn_res) => conn_res.context(DialSnafu)?,
            None => return Ok(()),
        };
        self.run_connected(conn)
            .instrument(info_span!("connected"))
            .await
    }

    /// Waits before dialing again, still recording requests.
    ///
    /// Returns `false` if the actor needs to shut down.
    async fn run_backoff(&mut self, delay: Duration) -> bool {
        let mut sleep = pin!(time::sleep(delay));
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("shutdown");
                    break false;
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("inbox closed, shutdown");
                        break false;
                    };
                    if !self.handle_message(msg) {
                        break false;
                    }
                }
                _ = &mut sleep => break true,
            }
        }
    }

    /// Actor loop when connecting to the relay.
    ///
    /// Returns `None` if the actor needs to shut down.  Returns `Some(Ok(conn))` when the
    /// connection is established, and `Some(Err(err))` if dialing the relay failed.
    async fn run_dialing(&mut self) -> Option<Result<Conn, DialError>> {
        trace!("connecting to relay");
        self.set_status(SocketStatus::Connecting);

        let mut dialing_fut = pin!(self.dial_relay());
        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("shutdown");
                    break None;
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("inbox closed, shutdown");
                        break None;
                    };
                    if !self.handle_message(msg) {
                        break None;
                    }
                }
                res = &mut dialing_fut => break Some(res),
            }
        }
    }

    /// Returns a future which will complete once connected to the relay.
    // This is using `impl Future` to return a future without a reference to self.
    fn dial_relay(&self) -> impl Future<Output = Result<Conn, DialError>> + use<> {
        let connect = self.transport.connect(self.url.clone());
        async move {
            match time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(conn)) => Ok(conn),
                Ok(Err(source)) => Err(DialError::Connect { source }),
                Err(_) => Err(DialError::Timeout {
                    timeout: CONNECT_TIMEOUT,
                }),
            }
        }
    }

    /// Runs the actor loop when connected to a relay.
    ///
    /// Returns `Ok` if the actor needs to shut down.  `Err` is returned if the connection
    /// to the relay is lost.
    async fn run_connected(&mut self, conn: Conn) -> Result<(), RelayConnectionError> {
        debug!("connected to relay");
        event!(
            target: "murmur::_events::relay::connected",
            Level::DEBUG,
            url = %self.url,
        );

        let (mut stream, mut sink) = conn.split();
        self.connected = true;
        self.auth = AuthState::default();
        self.set_auth(AuthStatus::None);
        self.set_status(SocketStatus::Open);
        self.touch();
        self.resend_all();

        // Whether the relay answered anything on this connection.
        let mut established = false;
        let mut signing = pin!(MaybeFuture::<BoxFuture<Result<Event, SignerError>>>::idle());

        let res = loop {
            if let Err(err) = self.flush(&mut sink).await {
                break Err(err);
            }
            if !signing.is_armed() {
                if let Some(fut) = self.start_auth() {
                    signing.as_mut().arm(fut);
                }
            }
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("shutdown");
                    break Ok(());
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("inbox closed, shutdown");
                        break Ok(());
                    };
                    if !self.handle_message(msg) {
                        break Ok(());
                    }
                }
                res = &mut signing, if signing.is_armed() => {
                    signing.as_mut().disarm();
                    self.finish_auth(res);
                }
                exchange = self.quality.timeout() => {
                    self.exchange_timed_out(exchange);
                }
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        break Err(RunError::StreamClosed {});
                    };
                    match msg {
                        Ok(msg) => {
                            established = true;
                            self.touch();
                            self.handle_relay_msg(msg);
                        }
                        Err(source) => break Err(RunError::StreamRead { source }),
                    }
                }
            }
        };

        self.connected = false;
        self.outbox.clear();
        self.quality.fail_all();
        if res.is_ok() {
            if let Err(err) = sink.close().await {
                debug!("failed to close relay sink gracefully: {err:#}");
            }
        }

        res.map_err(|source| {
            if established {
                RelayConnectionError::Established { source }
            } else {
                RelayConnectionError::Handshake { source }
            }
        })
    }

    /// Sends all queued messages to the relay.
    async fn flush(&mut self, sink: &mut ConnSink) -> Result<(), RunError> {
        while let Some(msg) = self.outbox.pop_front() {
            trace!(%msg, "send");
            sink.send(msg).await.context(StreamWriteSnafu)?;
            self.touch();
        }
        Ok(())
    }

    /// Handles a request.
    ///
    /// Returns `false` if the actor should shut down.
    fn handle_message(&mut self, msg: ConnMessage) -> bool {
        match msg {
            ConnMessage::Subscribe { filters, listener } => {
                self.subscribe(filters, listener);
            }
            ConnMessage::Unsubscribe(listener) => {
                let closed: Vec<SubscriptionId> = self
                    .subscriptions
                    .iter_mut()
                    .filter(|(_, sub)| sub.listeners.contains_key(&listener))
                    .filter_map(|(id, sub)| {
                        sub.listeners.remove(&listener);
                        sub.listeners.is_empty().then(|| id.clone())
                    })
                    .collect();
                for id in closed {
                    self.close_subscription(&id);
                }
            }
            ConnMessage::Publish { event, reply } => match self.publishes.entry(event.id) {
                Entry::Occupied(mut entry) => entry.get_mut().replies.push(reply),
                Entry::Vacant(entry) => {
                    let id = event.id;
                    entry.insert(PendingPublish {
                        event,
                        replies: vec![reply],
                        awaiting_auth: false,
                    });
                    if self.connected {
                        self.send_event(id);
                    }
                }
            },
            ConnMessage::Count { filters, reply } => {
                let id = self.next_request_id("count");
                self.counts.insert(id.clone(), PendingCount { filters, reply });
                if self.connected {
                    self.send_count(id);
                }
            }
            ConnMessage::Sweep => return self.sweep(),
        }
        true
    }

    fn subscribe(&mut self, filters: Vec<Filter>, listener: Listener) {
        if let Some(sub) = self
            .by_filters
            .get(&filters)
            .and_then(|id| self.subscriptions.get_mut(id))
        {
            trace!(listener = ?listener.id, "sharing subscription");
            sub.add_listener(&self.url, listener);
            return;
        }
        let id = self.next_request_id("sub");
        let mut sub = RelaySubscription::new(filters.clone());
        sub.add_listener(&self.url, listener);
        self.by_filters.insert(filters, id.clone());
        self.subscriptions.insert(id.clone(), sub);
        if self.connected {
            self.send_req(id);
        }
        self.update_subscription_count();
    }

    fn close_subscription(&mut self, id: &SubscriptionId) {
        let Some(sub) = self.subscriptions.remove(id) else {
            return;
        };
        trace!(%id, "closing subscription");
        self.by_filters.remove(&sub.filters);
        self.quality.cancel(&Exchange::Query(id.clone()));
        if self.connected {
            self.outbox.push_back(ClientMessage::Close(id.clone()));
        }
        self.update_subscription_count();
    }

    fn next_request_id(&mut self, prefix: &str) -> SubscriptionId {
        self.next_request_id += 1;
        SubscriptionId::new(format!("{prefix}-{}", self.next_request_id))
    }

    fn send_req(&mut self, id: SubscriptionId) {
        let Some(sub) = self.subscriptions.get(&id) else {
            return;
        };
        self.outbox.push_back(ClientMessage::Req {
            id: id.clone(),
            filters: sub.filters.clone(),
        });
        self.quality.start(Exchange::Query(id));
    }

    fn send_event(&mut self, id: EventId) {
        let Some(pending) = self.publishes.get(&id) else {
            return;
        };
        self.outbox
            .push_back(ClientMessage::Event(Box::new(Event::clone(&pending.event))));
        self.quality.start(Exchange::Publish(id));
    }

    fn send_count(&mut self, id: SubscriptionId) {
        let Some(count) = self.counts.get(&id) else {
            return;
        };
        self.outbox.push_back(ClientMessage::Count {
            id: id.clone(),
            filters: count.filters.clone(),
        });
        self.quality.start(Exchange::Query(id));
    }

    /// Sends all recorded requests on a fresh connection.
    fn resend_all(&mut self) {
        let subs: Vec<SubscriptionId> = self.subscriptions.keys().cloned().collect();
        for id in subs {
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                // The relay sends its stored records again.
                sub.stored.clear();
                sub.eose = false;
                sub.awaiting_auth = false;
            }
            self.send_req(id);
        }
        let publishes: Vec<EventId> = self.publishes.keys().copied().collect();
        for id in publishes {
            if let Some(pending) = self.publishes.get_mut(&id) {
                pending.awaiting_auth = false;
            }
            self.send_event(id);
        }
        let counts: Vec<SubscriptionId> = self.counts.keys().cloned().collect();
        for id in counts {
            self.send_count(id);
        }
    }

    fn handle_relay_msg(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Event {
                subscription,
                event,
            } => {
                if !self.subscriptions.contains_key(&subscription) {
                    trace!(%subscription, "record for unknown subscription");
                    return;
                }
                if let Err(err) = self.options.check_record(&event) {
                    debug!(id = %event.id.fmt_short(), "dropping record: {err:#}");
                    return;
                }
                let event: Arc<Event> = Arc::from(event);
                if self.seen.insert(event.id, &self.url) {
                    self.ingress.send(event.clone()).ok();
                }
                if let Some(sub) = self.subscriptions.get_mut(&subscription) {
                    if !sub.eose {
                        sub.stored.push(event.clone());
                    }
                    sub.send(SubscriptionEvent::Event {
                        relay: self.url.clone(),
                        event,
                    });
                }
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                self.quality.finish(&Exchange::Publish(event_id));
                if self.auth.event_id == Some(event_id) {
                    self.auth.event_id = None;
                    self.auth_answered(accepted, message);
                    return;
                }
                if !self.publishes.contains_key(&event_id) {
                    trace!(id = %event_id.fmt_short(), "OK for unknown record");
                    return;
                }
                if !accepted && message.starts_with(AUTH_REQUIRED_PREFIX) && self.can_await_auth()
                {
                    debug!(id = %event_id.fmt_short(), "publish requires authentication");
                    if let Some(pending) = self.publishes.get_mut(&event_id) {
                        pending.awaiting_auth = true;
                    }
                    self.auth_required();
                    return;
                }
                if !accepted && message.starts_with(RESTRICTED_PREFIX) {
                    self.restricted();
                }
                if let Some(pending) = self.publishes.remove(&event_id) {
                    let outcome = if accepted {
                        RelayOutcome::Accepted
                    } else {
                        RelayOutcome::Rejected(message)
                    };
                    pending.resolve(&self.url, outcome);
                }
            }
            RelayMessage::EndOfStoredEvents(subscription) => {
                self.quality.finish(&Exchange::Query(subscription.clone()));
                let Some(sub) = self.subscriptions.get_mut(&subscription) else {
                    return;
                };
                sub.eose = true;
                sub.send(SubscriptionEvent::Eose {
                    relay: self.url.clone(),
                });
            }
            RelayMessage::Closed {
                subscription,
                message,
            } => {
                self.quality.finish(&Exchange::Query(subscription.clone()));
                if self.counts.remove(&subscription).is_some() {
                    debug!(%subscription, "count refused: {message}");
                    return;
                }
                if !self.subscriptions.contains_key(&subscription) {
                    return;
                }
                if message.starts_with(AUTH_REQUIRED_PREFIX) && self.can_await_auth() {
                    debug!(%subscription, "subscription requires authentication");
                    if let Some(sub) = self.subscriptions.get_mut(&subscription) {
                        sub.awaiting_auth = true;
                    }
                    self.auth_required();
                    return;
                }
                if message.starts_with(RESTRICTED_PREFIX) {
                    self.restricted();
                }
                debug!(%subscription, "subscription closed by relay: {message}");
                self.drop_subscription(&subscription, message);
            }
            RelayMessage::Notice(message) => {
                debug!("notice: {message}");
            }
            RelayMessage::Auth { challenge } => {
                trace!("authentication challenge");
                self.auth.challenge = Some(challenge);
                if matches!(self.auth.status, AuthStatus::None | AuthStatus::Requested) {
                    self.set_auth(AuthStatus::Requested);
                }
            }
            RelayMessage::Count {
                subscription,
                count,
            } => {
                self.quality.finish(&Exchange::Query(subscription.clone()));
                if let Some(pending) = self.counts.remove(&subscription) {
                    pending.reply.send((self.url.clone(), count)).ok();
                }
            }
        }
    }

    /// Removes a subscription the relay closed, telling its listeners.
    fn drop_subscription(&mut self, id: &SubscriptionId, message: String) {
        if let Some(mut sub) = self.subscriptions.remove(id) {
            self.by_filters.remove(&sub.filters);
            sub.send(SubscriptionEvent::Closed {
                relay: self.url.clone(),
                message,
            });
        }
        self.update_subscription_count();
    }

    /// Whether a request refused for missing authentication can wait for it.
    fn can_await_auth(&self) -> bool {
        self.signer.can_sign()
            && matches!(
                self.auth.status,
                AuthStatus::None
                    | AuthStatus::Requested
                    | AuthStatus::PendingSignature
                    | AuthStatus::PendingResponse
            )
    }

    fn auth_required(&mut self) {
        if self.auth.status == AuthStatus::None {
            self.set_auth(AuthStatus::Requested);
        }
    }

    fn restricted(&mut self) {
        if self.auth.status == AuthStatus::Authenticated {
            self.set_auth(AuthStatus::Forbidden);
        }
    }

    /// Starts signing the answer to the relay's challenge, if one is due.
    fn start_auth(&mut self) -> Option<BoxFuture<Result<Event, SignerError>>> {
        if self.auth.status != AuthStatus::Requested || !self.signer.can_sign() {
            return None;
        }
        let challenge = self.auth.challenge.clone()?;
        let template = EventTemplate::new(Kind::AUTH, "")
            .tag(Tag::new(["relay".to_string(), self.url.to_string()]))
            .tag(Tag::new(["challenge".to_string(), challenge]));
        self.set_auth(AuthStatus::PendingSignature);
        Some(self.signer.sign_as_user(template))
    }

    fn finish_auth(&mut self, res: Result<Event, SignerError>) {
        match res {
            Ok(event) => {
                self.auth.event_id = Some(event.id);
                self.quality.start(Exchange::Publish(event.id));
                self.outbox.push_back(ClientMessage::Auth(Box::new(event)));
                self.set_auth(AuthStatus::PendingResponse);
            }
            Err(err) => {
                warn!("failed to sign authentication: {err:#}");
                self.set_auth(AuthStatus::Denied);
                self.fail_awaiting_auth(err.to_string());
            }
        }
    }

    fn auth_answered(&mut self, accepted: bool, message: String) {
        if !accepted {
            warn!("authentication rejected: {message}");
            self.set_auth(AuthStatus::Denied);
            self.fail_awaiting_auth(message);
            return;
        }
        self.set_auth(AuthStatus::Authenticated);
        let subs: Vec<SubscriptionId> = self
            .subscriptions
            .iter_mut()
            .filter(|(_, sub)| sub.awaiting_auth)
            .map(|(id, sub)| {
                sub.awaiting_auth = false;
                id.clone()
            })
            .collect();
        for id in subs {
            self.send_req(id);
        }
        let publishes: Vec<EventId> = self
            .publishes
            .iter_mut()
            .filter(|(_, pending)| pending.awaiting_auth)
            .map(|(id, pending)| {
                pending.awaiting_auth = false;
                *id
            })
            .collect();
        for id in publishes {
            self.send_event(id);
        }
    }

    /// Fails all requests waiting for authentication.
    fn fail_awaiting_auth(&mut self, message: String) {
        let subs: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.awaiting_auth)
            .map(|(id, _)| id.clone())
            .collect();
        for id in subs {
            self.drop_subscription(&id, message.clone());
        }
        let publishes: Vec<EventId> = self
            .publishes
            .iter()
            .filter(|(_, pending)| pending.awaiting_auth)
            .map(|(id, _)| *id)
            .collect();
        for id in publishes {
            if let Some(pending) = self.publishes.remove(&id) {
                pending.resolve(&self.url, RelayOutcome::Rejected(message.clone()));
            }
        }
    }

    fn exchange_timed_out(&mut self, exchange: Exchange) {
        match exchange {
            Exchange::Publish(id) if self.auth.event_id == Some(id) => {
                self.auth.event_id = None;
                self.set_auth(AuthStatus::Denied);
                self.fail_awaiting_auth("authentication timed out".to_string());
            }
            Exchange::Publish(id) => {
                // The publisher reports the timeout, the record is not sent again.
                if self.publishes.remove(&id).is_some() {
                    debug!(id = %id.fmt_short(), "publish timed out");
                }
            }
            Exchange::Query(id) => {
                if self.counts.remove(&id).is_some() {
                    debug!(%id, "count timed out");
                } else {
                    trace!(%id, "subscription slow to answer");
                }
            }
        }
    }

    /// Recomputes the quality and checks for inactivity.
    ///
    /// Returns `false` if the actor is idle and should shut down.
    fn sweep(&mut self) -> bool {
        // Forget requests nobody is waiting for anymore.
        let abandoned: Vec<SubscriptionId> = self
            .subscriptions
            .iter_mut()
            .filter_map(|(id, sub)| {
                sub.listeners.retain(|_, tx| !tx.is_closed());
                sub.listeners.is_empty().then(|| id.clone())
            })
            .collect();
        for id in abandoned {
            self.close_subscription(&id);
        }
        self.publishes.retain(|_, pending| {
            pending.replies.retain(|reply| !reply.is_closed());
            !pending.replies.is_empty()
        });
        self.counts.retain(|_, pending| !pending.reply.is_closed());

        let quality = self.quality.score();
        let degraded = quality < self.options.quality_threshold && self.carries_own_subscription();
        if degraded && !self.degraded {
            event!(
                target: "murmur::_events::relay::degraded",
                Level::WARN,
                url = %self.url,
                quality,
            );
        }
        self.degraded = degraded;
        let last_activity = self.last_activity;
        self.info.update(|info| {
            info.quality = quality;
            info.degraded = degraded;
            info.last_activity = Some(last_activity);
        });

        let idle = self.subscriptions.is_empty()
            && self.publishes.is_empty()
            && self.counts.is_empty()
            && self.last_activity.elapsed() >= self.options.idle_timeout;
        if idle {
            debug!(idle_timeout = ?self.options.idle_timeout, "inactive, exiting");
        }
        !idle
    }

    /// Whether a subscription names the local identity as author or `p` tag.
    fn carries_own_subscription(&self) -> bool {
        let Some(me) = self.signer.public_key() else {
            return false;
        };
        let hex = me.to_string();
        self.subscriptions
            .values()
            .any(|sub| sub.mentions(&hex, &me))
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn update_subscription_count(&mut self) {
        let count = self.subscriptions.len();
        self.info.update(|info| info.subscriptions = count);
    }

    fn set_status(&mut self, status: SocketStatus) {
        let last_activity = self.last_activity;
        let changed = self.info.update(|info| {
            info.status = status;
            info.last_activity = Some(last_activity);
        });
        if changed {
            event!(
                target: "murmur::_events::relay::status",
                Level::DEBUG,
                url = %self.url,
                %status,
            );
        }
    }

    fn set_auth(&mut self, status: AuthStatus) {
        self.auth.status = status;
        let changed = self.info.update(|info| info.auth = status);
        if changed {
            event!(
                target: "murmur::_events::relay::auth",
                Level::DEBUG,
                url = %self.url,
                %status,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{SecretKey, Timestamp};
    use murmur_relay::test_utils::MemoryTransport;
    use tokio_util::task::AbortOnDropHandle;
    use tracing_test::traced_test;

    use super::*;
    use crate::signer::{LocalSigner, NoSigner};

    /// Starts a new [`ConnActor`].
    fn spawn_conn_actor(
        transport: &MemoryTransport,
        url: RelayUrl,
        signer: Arc<dyn Signer>,
        options: PoolOptions,
    ) -> (
        mpsc::Sender<ConnMessage>,
        Watchable<ConnectionInfo>,
        mpsc::UnboundedReceiver<Arc<Event>>,
        AbortOnDropHandle<()>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        let info = Watchable::new(ConnectionInfo::new(url.clone()));
        let opts = ConnOptions {
            url,
            inbox: inbox_rx,
            transport: Arc::new(transport.clone()),
            signer,
            options,
            seen: SeenCache::new(128),
            ingress: ingress_tx,
            info: info.clone(),
            stop: CancellationToken::new(),
        };
        let span = info_span!("test-relay");
        let task = tokio::spawn(ConnActor::new(opts).run().instrument(span));
        (inbox_tx, info, ingress_rx, AbortOnDropHandle::new(task))
    }

    fn note(key: &SecretKey, content: &str, created_at: Timestamp) -> Event {
        EventTemplate::new(Kind::TEXT_NOTE, content)
            .created_at(created_at)
            .into_unsigned(key.public())
            .sign(key)
    }

    fn listener(id: u64) -> (Listener, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Listener {
                id: ListenerId(id),
                tx,
            },
            rx,
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_future_records_are_dropped() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://relay.example.com");
        let key = SecretKey::from_bytes(&[3u8; 32]);
        let now = Timestamp::now();
        relay.insert(note(&key, "ok", now));
        relay.insert(note(
            &key,
            "future",
            now.saturating_add(Duration::from_secs(3600)),
        ));

        let (inbox, _info, mut ingress, _task) = spawn_conn_actor(
            &transport,
            relay.url().clone(),
            Arc::new(NoSigner),
            PoolOptions::default(),
        );
        let (l, mut rx) = listener(1);
        inbox
            .send(ConnMessage::Subscribe {
                filters: vec![Filter::new().kind(Kind::TEXT_NOTE)],
                listener: l,
            })
            .await
            .unwrap();

        let Some(SubscriptionEvent::Event { event, .. }) = rx.recv().await else {
            panic!("expected record");
        };
        assert_eq!(event.content, "ok");
        assert!(matches!(
            rx.recv().await,
            Some(SubscriptionEvent::Eose { .. })
        ));
        assert_eq!(ingress.recv().await.unwrap().content, "ok");
        assert!(ingress.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_identical_filters_share_one_req() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://relay.example.com");
        let key = SecretKey::from_bytes(&[3u8; 32]);
        relay.insert(note(&key, "stored", Timestamp::now()));

        let (inbox, info, _ingress, _task) = spawn_conn_actor(
            &transport,
            relay.url().clone(),
            Arc::new(NoSigner),
            PoolOptions::default(),
        );
        let filters = vec![Filter::new().kind(Kind::TEXT_NOTE)];
        let (first, mut first_rx) = listener(1);
        inbox
            .send(ConnMessage::Subscribe {
                filters: filters.clone(),
                listener: first,
            })
            .await
            .unwrap();
        assert!(matches!(
            first_rx.recv().await,
            Some(SubscriptionEvent::Event { .. })
        ));
        assert!(matches!(
            first_rx.recv().await,
            Some(SubscriptionEvent::Eose { .. })
        ));

        // The late listener is caught up without a second REQ.
        let (second, mut second_rx) = listener(2);
        inbox
            .send(ConnMessage::Subscribe {
                filters,
                listener: second,
            })
            .await
            .unwrap();
        assert!(matches!(
            second_rx.recv().await,
            Some(SubscriptionEvent::Event { .. })
        ));
        assert!(matches!(
            second_rx.recv().await,
            Some(SubscriptionEvent::Eose { .. })
        ));
        assert_eq!(relay.req_count(), 1);
        assert_eq!(info.get().subscriptions, 1);

        // Only the last unsubscribe closes the relay subscription.
        inbox
            .send(ConnMessage::Unsubscribe(ListenerId(1)))
            .await
            .unwrap();
        inbox
            .send(ConnMessage::Sweep)
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(info.get().subscriptions, 1);
        inbox
            .send(ConnMessage::Unsubscribe(ListenerId(2)))
            .await
            .unwrap();
        let mut watcher = info.watch();
        while watcher.get().unwrap().subscriptions != 0 {
            watcher.updated().await.unwrap();
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_authenticates_and_resubscribes() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://auth.example.com");
        relay.set_require_auth(true);
        let key = SecretKey::from_bytes(&[3u8; 32]);
        relay.insert(note(&key, "members only", Timestamp::now()));

        let signer = LocalSigner::new(SecretKey::from_bytes(&[4u8; 32]));
        let (inbox, info, _ingress, _task) = spawn_conn_actor(
            &transport,
            relay.url().clone(),
            Arc::new(signer),
            PoolOptions::default(),
        );
        let (l, mut rx) = listener(1);
        inbox
            .send(ConnMessage::Subscribe {
                filters: vec![Filter::new().kind(Kind::TEXT_NOTE)],
                listener: l,
            })
            .await
            .unwrap();

        let Some(SubscriptionEvent::Event { event, .. }) = rx.recv().await else {
            panic!("expected record after authenticating");
        };
        assert_eq!(event.content, "members only");
        assert_eq!(info.get().auth, AuthStatus::Authenticated);
        assert_eq!(info.get().status, SocketStatus::Open);
    }

    #[tokio::test]
    async fn test_auth_required_without_signer_closes() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://auth.example.com");
        relay.set_require_auth(true);

        let (inbox, info, _ingress, _task) = spawn_conn_actor(
            &transport,
            relay.url().clone(),
            Arc::new(NoSigner),
            PoolOptions::default(),
        );
        let (l, mut rx) = listener(1);
        inbox
            .send(ConnMessage::Subscribe {
                filters: vec![Filter::new().kind(Kind::TEXT_NOTE)],
                listener: l,
            })
            .await
            .unwrap();
        let Some(SubscriptionEvent::Closed { message, .. }) = rx.recv().await else {
            panic!("expected closed");
        };
        assert!(message.starts_with(AUTH_REQUIRED_PREFIX));
        assert_eq!(info.get().auth, AuthStatus::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_exits() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://relay.example.com");
        let options = PoolOptions {
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let (inbox, info, _ingress, task) =
            spawn_conn_actor(&transport, relay.url().clone(), Arc::new(NoSigner), options);

        let mut watcher = info.watch();
        while watcher.get().unwrap().status != SocketStatus::Open {
            watcher.updated().await.unwrap();
        }
        assert_eq!(relay.connection_count(), 1);

        // Not idle long enough yet.
        time::sleep(Duration::from_secs(30)).await;
        inbox.send(ConnMessage::Sweep).await.unwrap();
        time::sleep(Duration::from_millis(10)).await;
        assert!(!inbox.is_closed());

        time::sleep(Duration::from_secs(31)).await;
        inbox.send(ConnMessage::Sweep).await.unwrap();
        task.await.unwrap();
        assert_eq!(info.get().status, SocketStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_resubscribes() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://relay.example.com");
        let key = SecretKey::from_bytes(&[3u8; 32]);

        let (inbox, info, _ingress, _task) = spawn_conn_actor(
            &transport,
            relay.url().clone(),
            Arc::new(NoSigner),
            PoolOptions::default(),
        );
        let (l, mut rx) = listener(1);
        inbox
            .send(ConnMessage::Subscribe {
                filters: vec![Filter::new().kind(Kind::TEXT_NOTE)],
                listener: l,
            })
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(SubscriptionEvent::Eose { .. })
        ));

        relay.set_reachable(false);
        let mut watcher = info.watch();
        while watcher.get().unwrap().status == SocketStatus::Open {
            watcher.updated().await.unwrap();
        }
        time::sleep(Duration::from_secs(1)).await;
        relay.set_reachable(true);

        // Stored records are sent again on the new connection.
        relay.insert(note(&key, "while away", Timestamp::now()));
        let Some(SubscriptionEvent::Event { event, .. }) = rx.recv().await else {
            panic!("expected record after reconnecting");
        };
        assert_eq!(event.content, "while away");
        assert!(relay.dial_count() >= 2);
        assert_eq!(info.get().subscriptions, 1);
    }

    #[tokio::test]
    async fn test_publish_outcomes() {
        let transport = MemoryTransport::new();
        let relay = transport.add_relay("wss://relay.example.com");
        let key = SecretKey::from_bytes(&[3u8; 32]);

        let (inbox, _info, _ingress, _task) = spawn_conn_actor(
            &transport,
            relay.url().clone(),
            Arc::new(NoSigner),
            PoolOptions::default(),
        );
        let (reply, mut replies) = mpsc::unbounded_channel();
        let event = Arc::new(note(&key, "hello", Timestamp::now()));
        inbox
            .send(ConnMessage::Publish {
                event: event.clone(),
                reply,
            })
            .await
            .unwrap();
        let (url, outcome) = replies.recv().await.unwrap();
        assert_eq!(&url, relay.url());
        assert_eq!(outcome, RelayOutcome::Accepted);
        assert_eq!(relay.events(), vec![Event::clone(&event)]);

        relay.set_policy(murmur_relay::test_utils::Policy::Reject("blocked: spam".into()));
        let (reply, mut replies) = mpsc::unbounded_channel();
        let other = Arc::new(note(&key, "again", Timestamp::now()));
        inbox
            .send(ConnMessage::Publish { event: other, reply })
            .await
            .unwrap();
        let (_, outcome) = replies.recv().await.unwrap();
        assert_eq!(outcome, RelayOutcome::Rejected("blocked: spam".into()));
    }
}
