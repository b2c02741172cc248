//! Hashtags seen on records.

use std::{collections::BTreeSet, sync::Arc};

use murmur_base::{Event, EventId, Timestamp};
use murmur_relay::BoxFuture;

use crate::{dispatch::Handler, store::Store, watchable::Notifier};

/// Activity of a single hashtag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topic {
    /// Ids of the records tagged with the topic.
    pub records: BTreeSet<EventId>,
    /// Creation time of the oldest tagged record.
    pub first_seen: Timestamp,
    /// Creation time of the newest tagged record.
    pub last_seen: Timestamp,
}

impl Topic {
    /// Number of distinct records tagged with the topic.
    pub fn count(&self) -> usize {
        self.records.len()
    }
}

/// Reduces `t` tags of any record kind into [`Topic`]s, keyed by the lowercased tag.
#[derive(Debug, Clone)]
pub struct Topics {
    topics: Store<String, Topic>,
}

impl Topics {
    pub(crate) fn new(notifier: Notifier) -> Self {
        Self {
            topics: Store::new(notifier),
        }
    }

    /// The activity of `topic`, case insensitive.
    pub fn get(&self, topic: &str) -> Option<Topic> {
        self.topics.get(&topic.to_lowercase())
    }

    /// The topics by name.
    pub fn store(&self) -> &Store<String, Topic> {
        &self.topics
    }

    /// The `limit` topics with the most records, most active first.
    pub fn trending(&self, limit: usize) -> Vec<(String, Topic)> {
        let mut topics = self.topics.entries();
        topics.sort_by(|(a_name, a), (b_name, b)| {
            b.count()
                .cmp(&a.count())
                .then(b.last_seen.cmp(&a.last_seen))
                .then(a_name.cmp(b_name))
        });
        topics.truncate(limit);
        topics
    }

    /// Applies the `t` tags of a record, returns the number of topics which changed.
    ///
    /// Applying a record again never changes a topic.
    pub fn apply(&self, event: &Event) -> usize {
        let mut names: Vec<String> = event
            .tag_values("t")
            .map(|value| value.trim().to_lowercase())
            .filter(|value| !value.is_empty())
            .collect();
        names.sort();
        names.dedup();

        let created_at = event.created_at;
        names
            .into_iter()
            .filter(|name| {
                self.topics.key(name.clone()).update(
                    || Topic {
                        records: BTreeSet::new(),
                        first_seen: created_at,
                        last_seen: created_at,
                    },
                    |topic| {
                        topic.records.insert(event.id);
                        topic.first_seen = topic.first_seen.min(created_at);
                        topic.last_seen = topic.last_seen.max(created_at);
                    },
                )
            })
            .count()
    }
}

impl Handler for Topics {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{EventTemplate, Kind, SecretKey, Tag};

    use super::*;

    fn tagged(topics: &[&str], created_at: u64) -> Event {
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let mut template =
            EventTemplate::new(Kind::TEXT_NOTE, "").created_at(Timestamp::from_secs(created_at));
        for topic in topics {
            template = template.tag(Tag::new(["t", *topic]));
        }
        template.into_unsigned(key.public()).sign(&key)
    }

    #[test]
    fn test_counts_distinct_records() {
        let topics = Topics::new(Notifier::new());
        let first = tagged(&["Rust", "rust"], 200);
        assert_eq!(topics.apply(&first), 1);
        // Seen again from another relay.
        assert_eq!(topics.apply(&first), 0);
        topics.apply(&tagged(&["rust", "nostr"], 100));

        let rust = topics.get("RUST").unwrap();
        assert_eq!(rust.count(), 2);
        assert_eq!(rust.first_seen, Timestamp::from_secs(100));
        assert_eq!(rust.last_seen, Timestamp::from_secs(200));

        let trending = topics.trending(1);
        assert_eq!(trending.len(), 1);
        assert_eq!(trending[0].0, "rust");
    }

    #[test]
    fn test_counts_survive_any_number_of_records() {
        let topics = Topics::new(Notifier::new());
        let first = tagged(&["rust"], 1);
        topics.apply(&first);
        for created_at in 2..=4097 {
            topics.apply(&tagged(&["rust"], created_at));
        }
        assert_eq!(topics.get("rust").unwrap().count(), 4097);

        // Resent long after, e.g. by a relay after a reconnect.
        assert_eq!(topics.apply(&first), 0);
        assert_eq!(topics.get("rust").unwrap().count(), 4097);
    }

    #[test]
    fn test_untagged_records_are_ignored() {
        let topics = Topics::new(Notifier::new());
        assert_eq!(topics.apply(&tagged(&[" "], 100)), 0);
        assert!(topics.store().is_empty());
    }
}
