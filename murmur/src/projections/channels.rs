//! Public chat channels.
//!
//! A channel is created by a creation record and identified by its id.  Metadata records
//! referencing the channel update it, but only when authored by the creator.  Metadata can
//! arrive before the creation record, it is held back until the creator is known.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use murmur_base::{Event, EventId, Kind, PublicKey, Timestamp};
use murmur_relay::BoxFuture;
use serde::Deserialize;
use tracing::{debug, trace};

use super::Deletions;
use crate::{
    dispatch::Handler,
    reconcile::{Lww, Reconcile, newest},
    store::Store,
    watchable::Notifier,
};

/// Metadata records held back per channel until the creation record arrives.
const MAX_PENDING_PER_CHANNEL: usize = 16;

/// Number of unknown channels metadata is held back for, least recently referenced dropped first.
const MAX_PENDING_CHANNELS: usize = 256;

/// The metadata fields of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMetadata {
    /// The channel name.
    pub name: Lww<String>,
    /// Free text.
    pub about: Lww<String>,
    /// Url of the channel picture.
    pub picture: Lww<String>,
}

/// The fields a creation or metadata record sets.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdate {
    #[allow(missing_docs)]
    #[serde(default)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub about: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub picture: Option<String>,
}

impl Reconcile for ChannelMetadata {
    type Update = ChannelUpdate;

    fn apply(&mut self, timestamp: Timestamp, update: ChannelUpdate) -> bool {
        let changed = [
            self.name.apply_opt(timestamp, update.name),
            self.about.apply_opt(timestamp, update.about),
            self.picture.apply_opt(timestamp, update.picture),
        ];
        changed.contains(&true)
    }

    fn updated_at(&self) -> Timestamp {
        newest([
            self.name.updated_at(),
            self.about.updated_at(),
            self.picture.updated_at(),
        ])
    }
}

/// A public chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Id of the creation record.
    pub id: EventId,
    /// Author of the creation record, the only one allowed to update the metadata.
    pub creator: PublicKey,
    /// When the channel was created.
    pub created_at: Timestamp,
    /// The reconciled metadata.
    pub metadata: ChannelMetadata,
}

/// Reduces channel creation and metadata records into [`Channel`]s.
#[derive(Debug, Clone)]
pub struct Channels {
    channels: Store<EventId, Channel>,
    pending: Arc<Mutex<LruCache<EventId, Vec<Arc<Event>>>>>,
    deletions: Deletions,
}

impl Channels {
    pub(crate) fn new(notifier: Notifier, deletions: Deletions) -> Self {
        let capacity = NonZeroUsize::new(MAX_PENDING_CHANNELS).unwrap_or(NonZeroUsize::MIN);
        Self {
            channels: Store::new(notifier),
            pending: Arc::new(Mutex::new(LruCache::new(capacity))),
            deletions,
        }
    }

    /// The channel created by record `id`, unless the creator deleted it.
    pub fn get(&self, id: &EventId) -> Option<Channel> {
        self.channels.get(id).filter(|channel| {
            !self
                .deletions
                .is_event_deleted(channel.id, channel.creator, channel.created_at)
        })
    }

    /// The channels by id.
    pub fn store(&self) -> &Store<EventId, Channel> {
        &self.channels
    }

    /// Applies a creation or metadata record, returns whether a channel changed.
    pub fn apply(&self, event: &Arc<Event>) -> bool {
        match event.kind {
            Kind::CHANNEL_CREATE => self.create(event),
            Kind::CHANNEL_METADATA => self.update(event),
            _ => false,
        }
    }

    fn create(&self, event: &Event) -> bool {
        let update = parse(event).unwrap_or_default();
        let (id, creator, created_at) = (event.id, event.pubkey, event.created_at);
        trace!(id = %id.fmt_short(), "channel created");
        let mut changed = self.channels.key(id).update(
            || Channel {
                id,
                creator,
                created_at,
                metadata: ChannelMetadata::default(),
            },
            |channel| {
                channel.metadata.apply(created_at, update);
            },
        );

        let pending = self
            .pending
            .lock()
            .expect("poisoned")
            .pop(&id)
            .unwrap_or_default();
        for event in pending {
            changed |= self.update(&event);
        }
        changed
    }

    fn update(&self, event: &Arc<Event>) -> bool {
        let Some(id) = event
            .tag_values("e")
            .next()
            .and_then(|value| value.parse::<EventId>().ok())
        else {
            debug!(id = %event.id.fmt_short(), "channel metadata without channel reference");
            return false;
        };
        let Some(channel) = self.channels.get(&id) else {
            let mut pending = self.pending.lock().expect("poisoned");
            let held = pending.get_or_insert_mut(id, Vec::new);
            if held.len() < MAX_PENDING_PER_CHANNEL {
                held.push(event.clone());
            }
            return false;
        };
        if channel.creator != event.pubkey {
            debug!(channel = %id.fmt_short(), "ignoring channel metadata by another author");
            return false;
        }
        let Some(update) = parse(event) else {
            return false;
        };
        let created_at = event.created_at;
        self.channels.key(id).update(
            || channel.clone(),
            |channel| {
                channel.metadata.apply(created_at, update);
            },
        )
    }
}

fn parse(event: &Event) -> Option<ChannelUpdate> {
    match serde_json::from_str(&event.content) {
        Ok(update) => Some(update),
        Err(err) => {
            debug!(id = %event.id.fmt_short(), "malformed channel metadata: {err:#}");
            None
        }
    }
}

impl Handler for Channels {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}
