//! Bounded entity cache with social-graph aware eviction.
//!
//! The [`BoundedCache`] keeps at most `capacity` entities.  When an insert overflows it,
//! the least relevant entries are evicted: entities owned by strangers go first, then those
//! of close contacts, the local identity's own entities last.  Within each tier the least
//! recently used entity goes first.  Until the social graph is loaded all entities are in
//! the same tier and eviction is purely by recency.
//!
//! The cache does not know the social graph, it asks a [`Proximity`] snapshot.

use std::{
    fmt,
    hash::Hash,
    sync::{Arc, Mutex},
};

use lru::LruCache;
use murmur_base::{Address, PublicKey, Timestamp};
use tracing::{debug, trace};

use crate::{
    reconcile::Reconcile,
    store::{KeyHandle, Store},
    watchable::Notifier,
};

/// Default maximum number of entities kept by a [`BoundedCache`].
pub const DEFAULT_CACHE_CAPACITY: usize = 5000;

/// Read-only view on how close an identity is to the local one.
pub trait Proximity: Send + Sync + 'static {
    /// Whether the social graph was loaded, before that every identity is a stranger.
    fn is_loaded(&self) -> bool;

    /// Whether `pubkey` is the local identity.
    fn is_self(&self, pubkey: &PublicKey) -> bool;

    /// Whether `pubkey` is followed by the local identity, directly or through one of its
    /// follows.
    fn is_close_contact(&self, pubkey: &PublicKey) -> bool;

    /// A consistent, lock-free view used to rank all entries of one eviction.
    fn snapshot(&self) -> Arc<dyn Proximity>;
}

impl<T: Proximity + ?Sized> Proximity for Arc<T> {
    fn is_loaded(&self) -> bool {
        self.as_ref().is_loaded()
    }

    fn is_self(&self, pubkey: &PublicKey) -> bool {
        self.as_ref().is_self(pubkey)
    }

    fn is_close_contact(&self, pubkey: &PublicKey) -> bool {
        self.as_ref().is_close_contact(pubkey)
    }

    fn snapshot(&self) -> Arc<dyn Proximity> {
        self.as_ref().snapshot()
    }
}

/// Cache keys which belong to an identity.
pub trait Owned {
    /// The identity owning the entity.
    fn owner(&self) -> &PublicKey;
}

impl Owned for PublicKey {
    fn owner(&self) -> &PublicKey {
        self
    }
}

impl Owned for Address {
    fn owner(&self) -> &PublicKey {
        &self.pubkey
    }
}

/// Eviction tier, lower tiers are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Tier {
    Stranger,
    CloseContact,
    Own,
}

/// A capacity-limited [`Store`] of reconciled entities.
///
/// Cheaply clonable, all clones share the same entries.
pub struct BoundedCache<K, V> {
    store: Store<K, V>,
    proximity: Arc<dyn Proximity>,
    capacity: usize,
    recency: Arc<Mutex<LruCache<K, ()>>>,
}

impl<K, V> Clone for BoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            proximity: self.proximity.clone(),
            capacity: self.capacity,
            recency: self.recency.clone(),
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Owned + Ord + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Reconcile + PartialEq + Send + Sync + 'static,
{
    /// Creates an empty cache.
    ///
    /// A `capacity` of zero is treated as one.
    pub fn new(capacity: usize, proximity: Arc<dyn Proximity>, notifier: Notifier) -> Self {
        Self {
            store: Store::new(notifier),
            proximity,
            capacity: capacity.max(1),
            recency: Arc::new(Mutex::new(LruCache::unbounded())),
        }
    }

    /// The maximum number of entities.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of cached entities.
    pub fn len(&self) -> usize {
        self.recency.lock().expect("poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying reactive store.
    pub fn store(&self) -> &Store<K, V> {
        &self.store
    }

    /// Returns the handle for `key`, see [`Store::key`].
    ///
    /// The handle does not count as a use of the entity.
    pub fn key(&self, key: K) -> KeyHandle<K, V> {
        self.store.key(key)
    }

    /// Whether `key` is cached, does not count as a use.
    pub fn contains(&self, key: &K) -> bool {
        self.recency.lock().expect("poisoned").contains(key)
    }

    /// The cached entity, marking it as recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.store.get(key)?;
        self.recency.lock().expect("poisoned").promote(key);
        Some(value)
    }

    /// Reconciles a record's update into the entity, creating it if absent.
    ///
    /// Returns whether the entity changed.  The entity counts as recently used even if the
    /// update was stale.
    pub fn patch(&self, key: K, timestamp: Timestamp, update: V::Update) -> bool {
        let changed = self
            .store
            .key(key.clone())
            .update(V::default, |entity| {
                entity.apply(timestamp, update);
            });
        self.touch(key);
        changed
    }

    /// Inserts an entity as is, replacing any previous one.
    ///
    /// Used to restore persisted entities, which were reconciled before.
    pub fn insert(&self, key: K, value: V) -> bool {
        let changed = self.store.set(key.clone(), value);
        self.touch(key);
        changed
    }

    /// Removes an entity.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.recency.lock().expect("poisoned").pop(key);
        self.store.remove(key)
    }

    fn touch(&self, key: K) {
        let evicted = {
            let mut recency = self.recency.lock().expect("poisoned");
            recency.put(key, ());
            self.select_victims(&recency)
        };
        for key in evicted {
            trace!(?key, "evicting");
            self.recency.lock().expect("poisoned").pop(&key);
            self.store.remove(&key);
        }
    }

    /// Picks exactly enough entries to return to capacity, least relevant first.
    fn select_victims(&self, recency: &LruCache<K, ()>) -> Vec<K> {
        let overflow = recency.len().saturating_sub(self.capacity);
        if overflow == 0 {
            return Vec::new();
        }
        let proximity = self.proximity.snapshot();
        let loaded = proximity.is_loaded();
        // Least recently used first.
        let mut candidates: Vec<(Tier, usize, &K)> = recency
            .iter()
            .rev()
            .enumerate()
            .map(|(age, (key, _))| (tier(proximity.as_ref(), loaded, key.owner()), age, key))
            .collect();
        candidates.sort_by_key(|(tier, age, _)| (*tier, *age));
        let victims: Vec<K> = candidates
            .into_iter()
            .take(overflow)
            .map(|(_, _, key)| key.clone())
            .collect();
        debug!(
            evicted = victims.len(),
            capacity = self.capacity,
            "cache over capacity"
        );
        victims
    }
}

fn tier(proximity: &dyn Proximity, loaded: bool, owner: &PublicKey) -> Tier {
    if !loaded {
        Tier::Stranger
    } else if proximity.is_self(owner) {
        Tier::Own
    } else if proximity.is_close_contact(owner) {
        Tier::CloseContact
    } else {
        Tier::Stranger
    }
}

/// Used in place of the social graph when the local identity is unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProximity;

impl Proximity for NoProximity {
    fn is_loaded(&self) -> bool {
        false
    }

    fn is_self(&self, _pubkey: &PublicKey) -> bool {
        false
    }

    fn is_close_contact(&self, _pubkey: &PublicKey) -> bool {
        false
    }

    fn snapshot(&self) -> Arc<dyn Proximity> {
        Arc::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use murmur_base::SecretKey;

    use super::*;
    use crate::reconcile::Lww;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Named {
        name: Lww<String>,
    }

    impl Reconcile for Named {
        type Update = String;

        fn apply(&mut self, timestamp: Timestamp, update: String) -> bool {
            self.name.apply(timestamp, update)
        }

        fn updated_at(&self) -> Timestamp {
            self.name.updated_at()
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Graph {
        me: Option<PublicKey>,
        close: BTreeSet<PublicKey>,
    }

    impl Proximity for Graph {
        fn is_loaded(&self) -> bool {
            self.me.is_some()
        }

        fn is_self(&self, pubkey: &PublicKey) -> bool {
            self.me.as_ref() == Some(pubkey)
        }

        fn is_close_contact(&self, pubkey: &PublicKey) -> bool {
            self.close.contains(pubkey)
        }

        fn snapshot(&self) -> Arc<dyn Proximity> {
            Arc::new(self.clone())
        }
    }

    /// Counts how often the shared graph is consulted.
    #[derive(Debug, Default)]
    struct Counting {
        graph: Graph,
        snapshots: AtomicUsize,
        lookups: AtomicUsize,
    }

    impl Proximity for Counting {
        fn is_loaded(&self) -> bool {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            self.graph.is_loaded()
        }

        fn is_self(&self, pubkey: &PublicKey) -> bool {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            self.graph.is_self(pubkey)
        }

        fn is_close_contact(&self, pubkey: &PublicKey) -> bool {
            self.lookups.fetch_add(1, Ordering::Relaxed);
            self.graph.is_close_contact(pubkey)
        }

        fn snapshot(&self) -> Arc<dyn Proximity> {
            self.snapshots.fetch_add(1, Ordering::Relaxed);
            self.graph.snapshot()
        }
    }

    fn key(i: u8) -> PublicKey {
        SecretKey::from_bytes(&[i; 32]).public()
    }

    #[test]
    fn test_patch_reconciles() {
        let cache: BoundedCache<PublicKey, Named> =
            BoundedCache::new(10, Arc::new(NoProximity), Notifier::new());
        assert!(cache.patch(key(1), Timestamp::from_secs(100), "Alice".into()));
        assert!(!cache.patch(key(1), Timestamp::from_secs(50), "Old".into()));
        let entity = cache.get(&key(1)).unwrap();
        assert_eq!(entity.name.get().map(String::as_str), Some("Alice"));
        assert_eq!(entity.updated_at(), Timestamp::from_secs(100));
    }

    #[test]
    fn test_evicts_by_recency_without_graph() {
        let cache: BoundedCache<PublicKey, Named> =
            BoundedCache::new(3, Arc::new(NoProximity), Notifier::new());
        for i in 1..=3 {
            cache.patch(key(i), Timestamp::from_secs(1), format!("{i}"));
        }
        // Using the oldest entry makes the second one the least recently used.
        assert!(cache.get(&key(1)).is_some());
        cache.patch(key(4), Timestamp::from_secs(1), "4".into());

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.store().get(&key(2)).is_none());
    }

    #[test]
    fn test_retains_close_contacts() {
        let me = key(0);
        let graph = Graph {
            me: Some(me),
            close: [key(1), key(2)].into_iter().collect(),
        };
        let cache: BoundedCache<PublicKey, Named> =
            BoundedCache::new(4, Arc::new(graph), Notifier::new());

        cache.patch(me, Timestamp::from_secs(1), "me".into());
        cache.patch(key(1), Timestamp::from_secs(1), "close".into());
        for i in 10..20 {
            cache.patch(key(i), Timestamp::from_secs(1), "stranger".into());
        }
        cache.patch(key(2), Timestamp::from_secs(1), "close".into());

        assert_eq!(cache.len(), 4);
        assert!(cache.contains(&me));
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        // Only the most recent stranger survives.
        assert!(cache.contains(&key(19)));
        assert!(!cache.contains(&key(18)));
    }

    #[test]
    fn test_evicts_close_contacts_before_self() {
        let me = key(0);
        let graph = Graph {
            me: Some(me),
            close: [key(1), key(2)].into_iter().collect(),
        };
        let cache: BoundedCache<PublicKey, Named> =
            BoundedCache::new(2, Arc::new(graph), Notifier::new());
        cache.patch(me, Timestamp::from_secs(1), "me".into());
        cache.patch(key(1), Timestamp::from_secs(1), "a".into());
        cache.patch(key(2), Timestamp::from_secs(1), "b".into());

        assert!(cache.contains(&me));
        assert!(!cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
    }

    #[test]
    fn test_one_graph_snapshot_per_eviction() {
        let me = key(0);
        let counting = Arc::new(Counting {
            graph: Graph {
                me: Some(me),
                close: [key(1)].into_iter().collect(),
            },
            ..Default::default()
        });
        let cache: BoundedCache<PublicKey, Named> =
            BoundedCache::new(3, counting.clone(), Notifier::new());
        cache.patch(me, Timestamp::from_secs(1), "me".into());
        cache.patch(key(1), Timestamp::from_secs(1), "close".into());
        cache.patch(key(2), Timestamp::from_secs(1), "stranger".into());
        assert_eq!(counting.snapshots.load(Ordering::Relaxed), 0);

        for i in 10..15 {
            cache.patch(key(i), Timestamp::from_secs(1), "stranger".into());
        }
        assert_eq!(counting.snapshots.load(Ordering::Relaxed), 5);
        assert_eq!(counting.lookups.load(Ordering::Relaxed), 0);
        assert!(cache.contains(&me));
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(14)));
    }
}
