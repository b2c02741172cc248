use std::{
    collections::BTreeSet,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use murmur_base::{EventId, RelayUrl};

/// A cache of recently received record ids and the relays they were received from.
///
/// The same record is usually delivered by several relays, this cache lets the receive
/// path forward each record only once.
#[derive(Debug, Clone, Default)]
pub enum SeenCache {
    /// The cache is disabled, every record is considered new.
    #[default]
    Disabled,
    /// The cache is enabled with a fixed capacity.  It is shared between the connections.
    Shared(Arc<Mutex<lru::LruCache<EventId, BTreeSet<RelayUrl>>>>),
}

impl SeenCache {
    /// Creates a new cache with the given capacity.
    ///
    /// If the capacity is zero, the cache is disabled and has zero overhead.
    pub fn new(capacity: usize) -> Self {
        let Some(capacity) = NonZeroUsize::new(capacity) else {
            return Self::Disabled;
        };
        let cache = lru::LruCache::new(capacity);
        Self::Shared(Arc::new(Mutex::new(cache)))
    }

    /// Records that `id` was received from `relay`.
    ///
    /// Returns `true` if the record was not seen before.
    pub fn insert(&self, id: EventId, relay: &RelayUrl) -> bool {
        let Self::Shared(cache) = self else {
            return true;
        };
        let mut cache = cache.lock().expect("poisoned");
        if let Some(relays) = cache.get_mut(&id) {
            relays.insert(relay.clone());
            return false;
        }
        cache.put(id, BTreeSet::from([relay.clone()]));
        true
    }

    /// Whether the record was seen recently.
    pub fn contains(&self, id: &EventId) -> bool {
        match self {
            Self::Disabled => false,
            Self::Shared(cache) => cache.lock().expect("poisoned").contains(id),
        }
    }

    /// The relays a record was received from, empty if unknown or forgotten.
    pub fn seen_on(&self, id: &EventId) -> Vec<RelayUrl> {
        match self {
            Self::Disabled => Vec::new(),
            Self::Shared(cache) => cache
                .lock()
                .expect("poisoned")
                .peek(id)
                .map(|relays| relays.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}
