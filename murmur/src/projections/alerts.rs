//! Records by others mentioning the local identity.

use std::sync::Arc;

use murmur_base::{Event, EventId, Kind, PublicKey, Timestamp};
use murmur_relay::BoxFuture;

use super::Deletions;
use crate::{
    dispatch::Handler,
    watchable::{Notifier, Watchable, Watcher},
};

/// Default number of alerts kept.
pub const DEFAULT_ALERTS_CAPACITY: usize = 500;

/// The newest records mentioning the local identity, newest first.
#[derive(Debug, Clone)]
pub struct Alerts {
    me: Option<PublicKey>,
    capacity: usize,
    alerts: Watchable<Vec<Arc<Event>>>,
    last_read: Watchable<Timestamp>,
    deletions: Deletions,
}

impl Alerts {
    pub(crate) fn new(
        me: Option<PublicKey>,
        capacity: usize,
        notifier: Notifier,
        deletions: Deletions,
    ) -> Self {
        Self {
            me,
            capacity: capacity.max(1),
            alerts: Watchable::with_notifier(Vec::new(), notifier.clone()),
            last_read: Watchable::with_notifier(Timestamp::ZERO, notifier),
            deletions,
        }
    }

    /// The current alerts, newest first, without records deleted by their authors.
    pub fn get(&self) -> Vec<Arc<Event>> {
        let mut alerts = self.alerts.get();
        alerts.retain(|alert| !self.deletions.is_deleted(alert));
        alerts
    }

    /// Watches the alerts.
    pub fn watch(&self) -> Watcher<Vec<Arc<Event>>> {
        self.alerts.watch()
    }

    /// Marks all alerts up to `timestamp` as read.
    pub fn mark_read(&self, timestamp: Timestamp) {
        self.last_read.update(|last| *last = (*last).max(timestamp));
    }

    /// The number of alerts newer than the last read mark.
    pub fn unread(&self) -> usize {
        let last_read = self.last_read.get();
        self.get()
            .iter()
            .take_while(|event| event.created_at > last_read)
            .count()
    }

    /// Adds `event` if it mentions the local identity, returns whether the alerts changed.
    ///
    /// Own records, repeated records, deleted records and records older than all kept
    /// alerts of a full list are not added.  A deletion record drops the alerts it deletes.
    pub fn apply(&self, event: &Arc<Event>) -> bool {
        let Some(me) = self.me else {
            return false;
        };
        if event.kind == Kind::DELETION {
            return self.prune(event);
        }
        if event.pubkey == me || !event.mentions(&me) || self.deletions.is_deleted(event) {
            return false;
        }
        let capacity = self.capacity;
        self.alerts.update(|alerts| {
            if alerts.iter().any(|alert| alert.id == event.id) {
                return;
            }
            let position = alerts
                .partition_point(|alert| (alert.created_at, alert.id) > (event.created_at, event.id));
            alerts.insert(position, event.clone());
            alerts.truncate(capacity);
        })
    }
}

impl Alerts {
    fn prune(&self, deletion: &Event) -> bool {
        let ids: Vec<EventId> = deletion
            .tag_values("e")
            .filter_map(|value| value.parse().ok())
            .collect();
        if ids.is_empty() {
            return false;
        }
        self.alerts.update(|alerts| {
            alerts.retain(|alert| !(alert.pubkey == deletion.pubkey && ids.contains(&alert.id)))
        })
    }
}

impl Handler for Alerts {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{EventTemplate, Kind, SecretKey, Tag};

    use super::*;
    use crate::publish::RecentRecords;

    fn alerts(me: Option<PublicKey>, capacity: usize) -> Alerts {
        let notifier = Notifier::new();
        let deletions = Deletions::new(notifier.clone(), RecentRecords::new(10));
        Alerts::new(me, capacity, notifier, deletions)
    }

    fn reply(from: &SecretKey, to: &PublicKey, created_at: u64) -> Arc<Event> {
        Arc::new(
            EventTemplate::new(Kind::TEXT_NOTE, "hey")
                .tag(Tag::pubkey(to))
                .created_at(Timestamp::from_secs(created_at))
                .into_unsigned(from.public())
                .sign(from),
        )
    }

    #[test]
    fn test_newest_first_and_bounded() {
        let me = SecretKey::from_bytes(&[0u8; 32]);
        let bob = SecretKey::from_bytes(&[1u8; 32]);
        let alerts = alerts(Some(me.public()), 2);

        assert!(alerts.apply(&reply(&bob, &me.public(), 200)));
        assert!(alerts.apply(&reply(&bob, &me.public(), 300)));
        assert!(!alerts.apply(&reply(&bob, &me.public(), 300)));
        // Older than everything in a full list.
        assert!(!alerts.apply(&reply(&bob, &me.public(), 100)));
        // Own records and unrelated records are never alerts.
        assert!(!alerts.apply(&reply(&me, &me.public(), 400)));
        assert!(!alerts.apply(&reply(&bob, &bob.public(), 400)));

        let times: Vec<_> = alerts.get().iter().map(|e| e.created_at.as_secs()).collect();
        assert_eq!(times, [300, 200]);

        assert_eq!(alerts.unread(), 2);
        alerts.mark_read(Timestamp::from_secs(250));
        assert_eq!(alerts.unread(), 1);
    }

    #[test]
    fn test_without_identity() {
        let bob = SecretKey::from_bytes(&[1u8; 32]);
        let alerts = alerts(None, 10);
        assert!(!alerts.apply(&reply(&bob, &bob.public(), 100)));
        assert!(alerts.get().is_empty());
    }

    #[test]
    fn test_deleted_mentions_are_dropped() {
        let me = SecretKey::from_bytes(&[0u8; 32]);
        let bob = SecretKey::from_bytes(&[1u8; 32]);
        let mallory = SecretKey::from_bytes(&[2u8; 32]);
        let alerts = alerts(Some(me.public()), 10);
        let mention = reply(&bob, &me.public(), 100);
        alerts.apply(&mention);

        let delete = |key: &SecretKey| {
            Arc::new(
                EventTemplate::new(Kind::DELETION, "")
                    .tag(Tag::event(mention.id))
                    .created_at(Timestamp::from_secs(200))
                    .into_unsigned(key.public())
                    .sign(key),
            )
        };
        assert!(!alerts.apply(&delete(&mallory)));
        assert_eq!(alerts.get().len(), 1);

        assert!(alerts.apply(&delete(&bob)));
        assert!(alerts.get().is_empty());
        assert_eq!(alerts.unread(), 0);
    }
}
