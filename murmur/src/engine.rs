//! The [`Engine`] ties the pool, the batching worker, the dispatcher, the projections and
//! the publisher together.
//!
//! Records flow from the relays through the [`Pool`] into the [`Worker`], which hands
//! them in batches to the [`Dispatcher`].  Each batch is dispatched inside one notification
//! batch, so watchers of the projections see a single notification per entity and tick.
//! Locally published records take the same path, echoed by the [`Publisher`].
//!
//! Engines hold no global state, several of them can run side by side.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Duration,
};

use lru::LruCache;
use murmur_base::{Address, Event, EventId, Filter, PublicKey, RelayUrl, Timestamp};
use murmur_relay::{BoxFuture, Transport};
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, info_span, trace};

use crate::{
    cache::DEFAULT_CACHE_CAPACITY,
    dispatch::Dispatcher,
    pool::{ConnectionInfo, InvalidRecord, Pool, PoolOptions, Subscription},
    projections::{ProjectionContext, Projections, alerts::DEFAULT_ALERTS_CAPACITY},
    publish::{PublishError, PublishInput, PublishProgress, Publisher, RecentRecords},
    signer::{NoSigner, Signer},
    storage::{Storage, StorageError},
    watchable::Notifier,
    worker::{Consumer, Worker, WorkerOptions},
};

/// Default timeout of one-shot count and load queries.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of dispatched record ids remembered.
pub const DEFAULT_DEDUPE_CAPACITY: usize = 10_000;

/// Default number of recently seen records kept for rebroadcasting.
pub const DEFAULT_RECENT_CAPACITY: usize = 2_000;

/// Options of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Relays used when no relays are given explicitly.
    pub relays: Vec<RelayUrl>,
    /// Capacity of each bounded cache.
    pub cache_capacity: usize,
    /// Options of the batching worker.
    pub worker: WorkerOptions,
    /// Options of the relay pool.
    pub pool: PoolOptions,
    /// Timeout of one-shot count and load queries.
    pub query_timeout: Duration,
    /// Number of dispatched record ids remembered to skip repeated records.
    pub dedupe_capacity: usize,
    /// Number of recently seen records kept to rebroadcast referenced records.
    pub recent_capacity: usize,
    /// Maximum number of alerts kept.
    pub alerts_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            worker: WorkerOptions::default(),
            pool: PoolOptions::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            alerts_capacity: DEFAULT_ALERTS_CAPACITY,
        }
    }
}

/// Errors building an [`Engine`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum BuildError {
    #[snafu(display("no transport configured"))]
    NoTransport { backtrace: Option<Backtrace> },
}

/// Errors ingesting a record from outside the relay pool.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    #[snafu(display("invalid record"))]
    InvalidRecord {
        source: InvalidRecord,
        backtrace: Option<Backtrace>,
    },
    #[snafu(display("engine is shut down"))]
    Shutdown { backtrace: Option<Backtrace> },
}

/// Builder for [`Engine`].
#[derive(Debug)]
pub struct Builder {
    transport: Option<Arc<dyn Transport>>,
    signer: Option<Arc<dyn Signer>>,
    storage: Option<Arc<dyn Storage>>,
    options: EngineOptions,
    default_projections: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            transport: None,
            signer: None,
            storage: None,
            options: EngineOptions::default(),
            default_projections: true,
        }
    }
}

impl Builder {
    /// Sets the transport relays are dialed with.
    ///
    /// Defaults to websockets if the `websocket` feature is enabled.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets the signer of the local identity.
    ///
    /// Without a signer the engine is read-only.
    pub fn signer(mut self, signer: impl Signer) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Sets the storage entities are persisted to.
    pub fn storage(mut self, storage: impl Storage) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Sets all options at once.
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the default relays.
    pub fn relays(mut self, relays: impl IntoIterator<Item = RelayUrl>) -> Self {
        self.options.relays = relays.into_iter().collect();
        self
    }

    /// Sets the capacity of the bounded caches.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.options.cache_capacity = capacity;
        self
    }

    /// Sets the batching of inbound records.
    pub fn worker_options(mut self, options: WorkerOptions) -> Self {
        self.options.worker = options;
        self
    }

    /// Sets the options of the relay pool.
    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.options.pool = options;
        self
    }

    /// Whether to register the built-in [`Projections`], `true` by default.
    pub fn default_projections(mut self, enabled: bool) -> Self {
        self.default_projections = enabled;
        self
    }

    /// Starts the engine.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Engine, BuildError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };
        let signer: Arc<dyn Signer> = self.signer.unwrap_or_else(|| Arc::new(NoSigner));
        let me = signer.public_key();
        let options = self.options;

        let (pool, ingress) = Pool::spawn(transport, signer.clone(), options.pool.clone());
        let worker: Worker<Arc<Event>> = Worker::spawn(options.worker);
        let dispatcher = Dispatcher::new();
        let notifier = Notifier::new();
        let recent = RecentRecords::new(options.recent_capacity);

        let projections = self.default_projections.then(|| {
            let projections = Projections::new(&ProjectionContext {
                me,
                notifier: notifier.clone(),
                cache_capacity: options.cache_capacity,
                storage: self.storage.clone(),
                recent: recent.clone(),
                alerts_capacity: options.alerts_capacity,
            });
            projections.register(&dispatcher);
            projections
        });

        worker.add_consumer(BatchDispatch {
            dispatcher: dispatcher.clone(),
            notifier: notifier.clone(),
            recent: recent.clone(),
            processed: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(options.dedupe_capacity).unwrap_or(NonZeroUsize::MIN),
            ))),
        });

        let cancel = CancellationToken::new();
        let forward = tokio::spawn(
            forward_ingress(ingress, worker.clone(), cancel.clone())
                .instrument(info_span!("ingress")),
        );

        let publisher = Publisher::new(pool.clone(), signer.clone(), worker.clone(), recent.clone());
        debug!(me = ?me.map(|pk| pk.fmt_short().to_string()), relays = options.relays.len(), "engine started");
        Ok(Engine {
            inner: Arc::new(EngineInner {
                pool,
                worker,
                dispatcher,
                publisher,
                projections,
                notifier,
                signer,
                options,
                cancel,
                _forward: AbortOnDropHandle::new(forward),
            }),
        })
    }
}

#[cfg(feature = "websocket")]
fn default_transport() -> Result<Arc<dyn Transport>, BuildError> {
    Ok(Arc::new(murmur_relay::WsTransport::new()))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> Result<Arc<dyn Transport>, BuildError> {
    NoTransportSnafu.fail()
}

/// Moves newly seen records from the pool into the worker.
async fn forward_ingress(
    mut ingress: mpsc::UnboundedReceiver<Arc<Event>>,
    worker: Worker<Arc<Event>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = ingress.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !worker.push(event) {
                    break;
                }
            }
        }
    }
    debug!("ingress closed");
}

/// The worker consumer dispatching each batch to the projections.
#[derive(Debug, Clone)]
struct BatchDispatch {
    dispatcher: Dispatcher,
    notifier: Notifier,
    recent: RecentRecords,
    processed: Arc<Mutex<LruCache<EventId, ()>>>,
}

impl Consumer<Arc<Event>> for BatchDispatch {
    fn consume(&self, batch: Arc<[Arc<Event>]>) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            trace!(len = batch.len(), "dispatching batch");
            let _batch = this.notifier.batch();
            for event in batch.iter() {
                let repeated = this
                    .processed
                    .lock()
                    .expect("poisoned")
                    .put(event.id, ())
                    .is_some();
                if repeated {
                    continue;
                }
                this.recent.insert(event.clone());
                this.dispatcher.dispatch(event.clone()).await;
            }
        })
    }
}

/// A client engine.
///
/// Cheaply clonable.  Dropping the last clone or calling [`Engine::shutdown`] stops all
/// its tasks and closes all relay connections.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    pool: Pool,
    worker: Worker<Arc<Event>>,
    dispatcher: Dispatcher,
    publisher: Publisher,
    projections: Option<Projections>,
    notifier: Notifier,
    signer: Arc<dyn Signer>,
    options: EngineOptions,
    cancel: CancellationToken,
    _forward: AbortOnDropHandle<()>,
}

impl Engine {
    /// Returns the builder for an [`Engine`].
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// The local identity, `None` for read-only engines.
    pub fn me(&self) -> Option<PublicKey> {
        self.inner.signer.public_key()
    }

    /// The options the engine was built with.
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// The relay pool.
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// The dispatcher, to register additional projections.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The batching worker all inbound and echoed records go through.
    pub fn pipeline(&self) -> &Worker<Arc<Event>> {
        &self.inner.worker
    }

    /// The notifier shared by all projection stores.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// The built-in projections, `None` if disabled on the builder.
    pub fn projections(&self) -> Option<&Projections> {
        self.inner.projections.as_ref()
    }

    /// Subscribes to `filters` on the default relays.
    ///
    /// Matching records are dispatched to the projections as they arrive, the returned
    /// subscription additionally yields them to the caller.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Subscription {
        self.subscribe_on(self.inner.options.relays.clone(), filters)
            .await
    }

    /// Subscribes to `filters` on `relays`, see [`Engine::subscribe`].
    pub async fn subscribe_on(
        &self,
        relays: impl IntoIterator<Item = RelayUrl>,
        filters: Vec<Filter>,
    ) -> Subscription {
        self.inner.pool.subscribe(relays, filters).await
    }

    /// Fetches stored records matching `filters` from the default relays.
    ///
    /// Returns what arrived within the query timeout, newest first.
    pub async fn load(&self, filters: Vec<Filter>) -> Vec<Arc<Event>> {
        self.inner
            .pool
            .load(
                self.inner.options.relays.clone(),
                filters,
                self.inner.options.query_timeout,
            )
            .await
    }

    /// Asks the default relays how many records match `filters`.
    pub async fn count(&self, filters: Vec<Filter>) -> Option<u64> {
        self.inner
            .pool
            .count(
                self.inner.options.relays.clone(),
                filters,
                self.inner.options.query_timeout,
            )
            .await
    }

    /// Publishes a record to the default relays.
    pub async fn publish(
        &self,
        input: impl Into<PublishInput>,
    ) -> Result<(Arc<Event>, PublishProgress), PublishError> {
        self.publish_to(self.inner.options.relays.clone(), input)
            .await
    }

    /// Publishes a record to `relays`, see [`Publisher::publish`].
    pub async fn publish_to(
        &self,
        relays: impl IntoIterator<Item = RelayUrl>,
        input: impl Into<PublishInput>,
    ) -> Result<(Arc<Event>, PublishProgress), PublishError> {
        self.inner.publisher.publish(relays, input).await
    }

    /// Feeds a record obtained outside the relay pool into the pipeline.
    ///
    /// The record is validated the same way relay records are, see
    /// [`PoolOptions::check_record`].
    pub fn ingest(&self, event: Event) -> Result<(), IngestError> {
        self.inner
            .options
            .pool
            .check_record(&event)
            .context(InvalidRecordSnafu)?;
        if !self.inner.worker.push(Arc::new(event)) {
            return ShutdownSnafu.fail();
        }
        Ok(())
    }

    /// The relays a record was received from.
    pub fn seen_on(&self, id: &EventId) -> Vec<RelayUrl> {
        self.inner.pool.seen_on(id)
    }

    /// Snapshot of all relay connections.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.pool.connections().await
    }

    /// Whether `event` is masked by a deletion.
    ///
    /// Always `false` without the built-in projections.
    pub fn is_deleted(&self, event: &Event) -> bool {
        self.projections()
            .is_some_and(|projections| projections.deletions.is_deleted(event))
    }

    /// Whether the entity at `address`, last updated at `updated_at`, is masked by a
    /// deletion.
    pub fn is_address_deleted(&self, address: &Address, updated_at: Timestamp) -> bool {
        self.projections().is_some_and(|projections| {
            projections
                .deletions
                .is_address_deleted(address, updated_at)
        })
    }

    /// Restores persisted entities from storage.
    ///
    /// Returns the number of restored entities.
    pub async fn restore(&self) -> Result<usize, StorageError> {
        match self.projections() {
            Some(projections) => projections.profiles.restore().await,
            None => Ok(0),
        }
    }

    /// Stops the engine.
    ///
    /// Queued records which were not dispatched yet are dropped.
    pub fn shutdown(&self) {
        debug!("engine shutting down");
        self.inner.cancel.cancel();
        self.inner.worker.shutdown();
        self.inner.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use murmur_base::{EventTemplate, Kind, SecretKey};
    use murmur_relay::test_utils::MemoryTransport;

    use super::*;
    use crate::{dispatch::HandlerFn, signer::LocalSigner};

    fn note(key: &SecretKey, content: &str) -> Event {
        EventTemplate::new(Kind::TEXT_NOTE, content)
            .into_unsigned(key.public())
            .sign(key)
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_records_reach_handlers_once() {
        let transport = MemoryTransport::new();
        let a = transport.add_relay("wss://a.example");
        let b = transport.add_relay("wss://b.example");
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let event = note(&key, "hello");
        a.insert(event.clone());
        b.insert(event.clone());

        let engine = Engine::builder()
            .transport(transport)
            .relays([a.url().clone(), b.url().clone()])
            .build()
            .unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        engine.dispatcher().add_handler(Kind::TEXT_NOTE, {
            let seen = seen.clone();
            HandlerFn::new(move |event: Arc<Event>| {
                seen.lock().unwrap().push(event.id);
                async {}
            })
        });

        let loaded = engine.load(vec![Filter::new().kind(Kind::TEXT_NOTE)]).await;
        assert_eq!(loaded.len(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(*seen.lock().unwrap(), vec![event.id]);
        assert_eq!(engine.seen_on(&event.id).len(), 2);
        engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_validates() {
        let engine = Engine::builder()
            .transport(MemoryTransport::new())
            .build()
            .unwrap();
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let mut event = note(&key, "hello");
        event.content = "tampered".into();
        assert!(matches!(
            engine.ingest(event),
            Err(IngestError::InvalidRecord { .. })
        ));
        assert!(engine.ingest(note(&key, "fine")).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingest_rejects_records_from_the_future() {
        let engine = Engine::builder()
            .transport(MemoryTransport::new())
            .build()
            .unwrap();
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let ahead = EventTemplate::new(Kind::METADATA, r#"{"name":"later"}"#)
            .created_at(Timestamp::now().saturating_add(Duration::from_secs(3600)))
            .into_unsigned(key.public())
            .sign(&key);
        assert!(matches!(
            engine.ingest(ahead),
            Err(IngestError::InvalidRecord {
                source: InvalidRecord::FromFuture { .. },
                ..
            })
        ));

        let current = EventTemplate::new(Kind::METADATA, r#"{"name":"now"}"#)
            .into_unsigned(key.public())
            .sign(&key);
        engine.ingest(current).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let profile = engine
            .projections()
            .unwrap()
            .profiles
            .get(&key.public())
            .unwrap();
        assert_eq!(profile.name.get().map(String::as_str), Some("now"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_from_signer() {
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let engine = Engine::builder()
            .transport(MemoryTransport::new())
            .signer(LocalSigner::new(key.clone()))
            .build()
            .unwrap();
        assert_eq!(engine.me(), Some(key.public()));

        let read_only = Engine::builder()
            .transport(MemoryTransport::new())
            .default_projections(false)
            .build()
            .unwrap();
        assert_eq!(read_only.me(), None);
        assert!(read_only.projections().is_none());
        assert_eq!(read_only.restore().await.unwrap(), 0);
    }
}
