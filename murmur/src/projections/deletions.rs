//! Deletion markers.
//!
//! Records are never removed.  A deletion request leaves a marker keyed by the deleted
//! record's id or address and its author; a record is masked if a marker for it exists
//! with a timestamp at least as new as the record.  Markers only ever grow newer, so
//! masking does not depend on the order records and deletions arrive in.

use std::sync::Arc;

use murmur_base::{Address, Event, EventId, PublicKey, Timestamp};
use murmur_relay::BoxFuture;
use tracing::{debug, trace};

use crate::{dispatch::Handler, publish::RecentRecords, store::Store, watchable::Notifier};

/// What a deletion marker masks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeletionTarget {
    /// A single record.
    Event(EventId),
    /// All versions of a replaceable or addressable record up to the marker.
    Address(Address),
}

/// Reduces deletion records into markers.
///
/// Markers are keyed by target and the author requesting the deletion: only an author's
/// own records are masked by their deletions.
#[derive(Debug, Clone)]
pub struct Deletions {
    markers: Store<(DeletionTarget, PublicKey), Timestamp>,
    recent: RecentRecords,
}

impl Deletions {
    pub(crate) fn new(notifier: Notifier, recent: RecentRecords) -> Self {
        Self {
            markers: Store::new(notifier),
            recent,
        }
    }

    /// The markers by target and author.
    pub fn markers(&self) -> &Store<(DeletionTarget, PublicKey), Timestamp> {
        &self.markers
    }

    /// Applies a deletion record, returns the number of markers which changed.
    pub fn apply(&self, event: &Event) -> usize {
        let mut changed = 0;
        for value in event.tag_values("e") {
            let Ok(id) = value.parse::<EventId>() else {
                continue;
            };
            // A known target must belong to the deleting author.
            if let Some(target) = self.recent.get(&id) {
                if target.pubkey != event.pubkey {
                    debug!(id = %id.fmt_short(), "ignoring deletion by another author");
                    continue;
                }
            }
            if self.mark(DeletionTarget::Event(id), event.pubkey, event.created_at) {
                changed += 1;
            }
        }
        for value in event.tag_values("a") {
            let Ok(address) = value.parse::<Address>() else {
                continue;
            };
            if address.pubkey != event.pubkey {
                debug!(%address, "ignoring deletion by another author");
                continue;
            }
            if self.mark(DeletionTarget::Address(address), event.pubkey, event.created_at) {
                changed += 1;
            }
        }
        changed
    }

    fn mark(&self, target: DeletionTarget, author: PublicKey, created_at: Timestamp) -> bool {
        trace!(?target, %created_at, "deletion marker");
        self.markers
            .key((target, author))
            .update(|| created_at, |marker| *marker = (*marker).max(created_at))
    }

    /// Whether `event` is masked by a deletion marker.
    pub fn is_deleted(&self, event: &Event) -> bool {
        let by_id = self.masks(
            DeletionTarget::Event(event.id),
            event.pubkey,
            event.created_at,
        );
        by_id
            || event.address().is_some_and(|address| {
                self.masks(DeletionTarget::Address(address), event.pubkey, event.created_at)
            })
    }

    /// Whether the entity at `address`, last updated at `updated_at`, is masked.
    pub fn is_address_deleted(&self, address: &Address, updated_at: Timestamp) -> bool {
        self.masks(
            DeletionTarget::Address(address.clone()),
            address.pubkey,
            updated_at,
        )
    }

    /// Whether the record `id` by `author`, created at `created_at`, is masked.
    pub fn is_event_deleted(&self, id: EventId, author: PublicKey, created_at: Timestamp) -> bool {
        self.masks(DeletionTarget::Event(id), author, created_at)
    }

    fn masks(&self, target: DeletionTarget, author: PublicKey, created_at: Timestamp) -> bool {
        self.markers
            .get(&(target, author))
            .is_some_and(|marker| marker >= created_at)
    }
}

impl Handler for Deletions {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}
