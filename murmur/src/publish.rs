//! Publishing local records.
//!
//! The [`Publisher`] turns a template into a signed record through the [`Signer`], echoes
//! it into the local pipeline so the local state reflects it right away, rebroadcasts the
//! records it references and sends it to the chosen relays.  The per-relay outcomes are
//! reported through [`PublishProgress`], there is no automatic retry.

use std::{
    collections::BTreeMap,
    num::NonZeroUsize,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures_lite::{Stream, StreamExt};
use lru::LruCache;
use murmur_base::{Event, EventError, EventId, EventTemplate, RelayUrl};
use snafu::{Backtrace, ResultExt, Snafu};
use tracing::{Level, debug, event};

use crate::{
    pool::{Pool, PublishOutcomes, RelayOutcome},
    signer::{Signer, SignerError},
    worker::Worker,
};

/// Errors preparing a record for publishing.
///
/// Once a record is prepared, publishing itself never fails: relays which do not accept
/// it are reported in the [`PublishReport`].
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum PublishError {
    #[snafu(display("no signer available"))]
    NoSigner { backtrace: Option<Backtrace> },
    #[snafu(display("failed to sign record"))]
    Signing {
        source: SignerError,
        backtrace: Option<Backtrace>,
    },
    #[snafu(display("invalid record"))]
    Invalid {
        source: EventError,
        backtrace: Option<Backtrace>,
    },
}

/// What to publish.
#[derive(Debug, Clone, derive_more::From)]
pub enum PublishInput {
    /// A template, signed as the local identity.
    Template(EventTemplate),
    /// A record signed elsewhere, published as is.
    Signed(Event),
}

/// Recently seen records by id.
///
/// Filled by the ingest pipeline, used to rebroadcast the records a published record
/// references.  Cheaply clonable.
#[derive(Debug, Clone)]
pub struct RecentRecords {
    inner: Arc<Mutex<LruCache<EventId, Arc<Event>>>>,
}

impl RecentRecords {
    /// Creates an empty set keeping at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Remembers a record.
    pub fn insert(&self, event: Arc<Event>) {
        self.inner.lock().expect("poisoned").put(event.id, event);
    }

    /// Returns a remembered record.
    pub fn get(&self, id: &EventId) -> Option<Arc<Event>> {
        self.inner.lock().expect("poisoned").get(id).cloned()
    }
}

/// Prepares, signs and sends local records.
#[derive(Debug, Clone)]
pub struct Publisher {
    pool: Pool,
    signer: Arc<dyn Signer>,
    pipeline: Worker<Arc<Event>>,
    recent: RecentRecords,
}

impl Publisher {
    /// Creates a publisher sending through `pool` and echoing into `pipeline`.
    pub fn new(
        pool: Pool,
        signer: Arc<dyn Signer>,
        pipeline: Worker<Arc<Event>>,
        recent: RecentRecords,
    ) -> Self {
        Self {
            pool,
            signer,
            pipeline,
            recent,
        }
    }

    /// The signer records are signed with.
    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.signer
    }

    /// Publishes a record to `relays`.
    ///
    /// Returns the final, signed record and the progress of the delivery.  If preparing the
    /// record fails nothing is echoed and nothing is sent.
    pub async fn publish(
        &self,
        relays: impl IntoIterator<Item = RelayUrl>,
        input: impl Into<PublishInput>,
    ) -> Result<(Arc<Event>, PublishProgress), PublishError> {
        let event = Arc::new(self.prepare(input.into()).await?);
        let relays: Vec<RelayUrl> = relays.into_iter().collect();
        debug!(id = %event.id.fmt_short(), kind = %event.kind, relays = relays.len(), "publishing");

        self.recent.insert(event.clone());
        self.pipeline.push(event.clone());
        self.rebroadcast_references(&relays, &event).await;

        let outcomes = self.pool.publish(relays, event.clone()).await;
        let progress = PublishProgress {
            event_id: event.id,
            outcomes,
            report: BTreeMap::new(),
        };
        Ok((event, progress))
    }

    async fn prepare(&self, input: PublishInput) -> Result<Event, PublishError> {
        match input {
            PublishInput::Template(template) => {
                if !self.signer.can_sign() {
                    return NoSignerSnafu.fail();
                }
                self.signer
                    .sign_as_user(template)
                    .await
                    .context(SigningSnafu)
            }
            PublishInput::Signed(event) => {
                event.verify().context(InvalidSnafu)?;
                Ok(event)
            }
        }
    }

    /// Sends the referenced records which are known locally along, so relays not having
    /// them yet can serve them.
    async fn rebroadcast_references(&self, relays: &[RelayUrl], event: &Event) {
        if relays.is_empty() {
            return;
        }
        let referenced: Vec<Arc<Event>> = event
            .tag_values("e")
            .filter_map(|id| id.parse::<EventId>().ok())
            .filter_map(|id| self.recent.get(&id))
            .collect();
        for reference in referenced {
            debug!(id = %reference.id.fmt_short(), "rebroadcasting referenced record");
            // Outcomes of rebroadcasts are not reported.
            drop(self.pool.publish(relays.iter().cloned(), reference).await);
        }
    }
}

/// The per-relay delivery of a published record.
///
/// A [`Stream`] yielding each relay's outcome once, as it arrives.  Use
/// [`PublishProgress::finish`] to wait for all of them.
#[derive(Debug)]
pub struct PublishProgress {
    event_id: EventId,
    outcomes: PublishOutcomes,
    report: BTreeMap<RelayUrl, RelayOutcome>,
}

impl PublishProgress {
    /// Waits for the outcome of all relays.
    pub async fn finish(mut self) -> PublishReport {
        while self.next().await.is_some() {}
        PublishReport {
            event_id: self.event_id,
            outcomes: self.report,
        }
    }
}

impl Stream for PublishProgress {
    type Item = (RelayUrl, RelayOutcome);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = std::task::ready!(Pin::new(&mut self.outcomes).poll_next(cx));
        if let Some((url, outcome)) = &item {
            event!(
                target: "murmur::_events::publish::outcome",
                Level::DEBUG,
                id = %self.event_id.fmt_short(),
                relay = %url,
                ?outcome,
            );
            self.report.insert(url.clone(), outcome.clone());
        }
        Poll::Ready(item)
    }
}

/// The outcome of publishing a record to all relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// The published record.
    pub event_id: EventId,
    /// The outcome per relay.
    pub outcomes: BTreeMap<RelayUrl, RelayOutcome>,
}

impl PublishReport {
    /// Whether at least one relay accepted the record.
    pub fn success(&self) -> bool {
        self.outcomes.values().any(RelayOutcome::is_accepted)
    }

    /// The relays which accepted the record.
    pub fn accepted(&self) -> impl Iterator<Item = &RelayUrl> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_accepted())
            .map(|(url, _)| url)
    }
}
