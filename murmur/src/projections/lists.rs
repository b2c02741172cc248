//! Replaceable and addressable lists.
//!
//! Lists are the latest version of a replaceable (`10000..20000`) or addressable
//! (`30000..40000`) record of an author, keyed by [`Address`].

use std::sync::Arc;

use murmur_base::{Address, Event, Kind, Tag, Timestamp};
use murmur_relay::BoxFuture;
use tracing::trace;

use super::Deletions;
use crate::{
    cache::BoundedCache,
    dispatch::Handler,
    reconcile::{Lww, Reconcile, newest},
};

/// The latest version of a list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListEntity {
    /// The entries of the list.
    pub tags: Lww<Vec<Tag>>,
    /// Content of the list record, often a title or encrypted private entries.
    pub content: Lww<String>,
}

/// The fields a list record sets.
#[derive(Debug, Clone)]
pub struct ListUpdate {
    #[allow(missing_docs)]
    pub tags: Vec<Tag>,
    #[allow(missing_docs)]
    pub content: String,
}

impl Reconcile for ListEntity {
    type Update = ListUpdate;

    fn apply(&mut self, timestamp: Timestamp, update: ListUpdate) -> bool {
        let tags = self.tags.apply(timestamp, update.tags);
        let content = self.content.apply(timestamp, update.content);
        tags || content
    }

    fn updated_at(&self) -> Timestamp {
        newest([self.tags.updated_at(), self.content.updated_at()])
    }
}

impl ListEntity {
    /// The first values of all entries named `name`.
    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .get()
            .into_iter()
            .flatten()
            .filter(move |tag| tag.name() == Some(name))
            .filter_map(Tag::value)
    }
}

/// Whether records of `kind` are reduced into lists.
///
/// Application data is addressable too, but has its own projection.
pub fn is_list_kind(kind: Kind) -> bool {
    let list = matches!(kind.as_u16(), 10_000..20_000 | 30_000..40_000);
    list && kind != Kind::APP_DATA
}

/// Reduces list records into [`ListEntity`]s.
#[derive(Debug, Clone)]
pub struct Lists {
    cache: BoundedCache<Address, ListEntity>,
    deletions: Deletions,
}

impl Lists {
    pub(crate) fn new(cache: BoundedCache<Address, ListEntity>, deletions: Deletions) -> Self {
        Self { cache, deletions }
    }

    /// The current version of the list at `address`, unless its author deleted it.
    pub fn get(&self, address: &Address) -> Option<ListEntity> {
        self.cache
            .get(address)
            .filter(|list| !self.deletions.is_address_deleted(address, list.updated_at()))
    }

    /// The underlying cache.
    pub fn cache(&self) -> &BoundedCache<Address, ListEntity> {
        &self.cache
    }

    /// Applies a list record, returns whether the list changed.
    ///
    /// Records of other kinds are ignored.
    pub fn apply(&self, event: &Event) -> bool {
        if !is_list_kind(event.kind) {
            return false;
        }
        let Some(address) = event.address() else {
            return false;
        };
        trace!(%address, "list");
        let update = ListUpdate {
            tags: event.tags.clone(),
            content: event.content.clone(),
        };
        self.cache.patch(address, event.created_at, update)
    }
}

impl Handler for Lists {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{EventTemplate, SecretKey};

    use super::*;
    use crate::{cache::NoProximity, publish::RecentRecords, watchable::Notifier};

    fn bookmarks(key: &SecretKey, entries: &[&str], created_at: u64) -> Event {
        let mut template = EventTemplate::new(Kind::new(30_003), "")
            .tag(Tag::identifier("reading"))
            .created_at(Timestamp::from_secs(created_at));
        for entry in entries {
            template = template.tag(Tag::new(["r", *entry]));
        }
        template.into_unsigned(key.public()).sign(key)
    }

    fn lists() -> Lists {
        let notifier = Notifier::new();
        Lists::new(
            BoundedCache::new(10, Arc::new(NoProximity), notifier.clone()),
            Deletions::new(notifier, RecentRecords::new(10)),
        )
    }

    #[test]
    fn test_latest_version_wins() {
        let lists = lists();
        let alice = SecretKey::from_bytes(&[1u8; 32]);
        let newer = bookmarks(&alice, &["https://b.example"], 200);
        let older = bookmarks(&alice, &["https://a.example"], 100);

        assert!(lists.apply(&newer));
        assert!(!lists.apply(&older));

        let list = lists.get(&newer.address().unwrap()).unwrap();
        let entries: Vec<_> = list.values("r").collect();
        assert_eq!(entries, ["https://b.example"]);
        assert_eq!(list.updated_at(), Timestamp::from_secs(200));
    }

    #[test]
    fn test_other_kinds_are_ignored() {
        let lists = lists();
        let alice = SecretKey::from_bytes(&[1u8; 32]);
        let note = EventTemplate::new(Kind::TEXT_NOTE, "hi")
            .into_unsigned(alice.public())
            .sign(&alice);
        let settings = EventTemplate::new(Kind::APP_DATA, "{}")
            .tag(Tag::identifier("app"))
            .into_unsigned(alice.public())
            .sign(&alice);
        assert!(!lists.apply(&note));
        assert!(!lists.apply(&settings));
        assert!(lists.cache().is_empty());
    }

    #[test]
    fn test_deleted_list_is_hidden_until_replaced() {
        let lists = lists();
        let alice = SecretKey::from_bytes(&[1u8; 32]);
        let first = bookmarks(&alice, &["https://a.example"], 100);
        let address = first.address().unwrap();
        lists.apply(&first);

        let deletion = EventTemplate::new(Kind::DELETION, "")
            .tag(Tag::address(&address))
            .created_at(Timestamp::from_secs(150))
            .into_unsigned(alice.public())
            .sign(&alice);
        lists.deletions.apply(&deletion);
        assert!(lists.get(&address).is_none());
        // The entity itself is kept, only masked.
        assert!(lists.cache().contains(&address));

        lists.apply(&bookmarks(&alice, &["https://b.example"], 200));
        let list = lists.get(&address).unwrap();
        assert_eq!(list.values("r").collect::<Vec<_>>(), ["https://b.example"]);
    }
}
