//! Keyed reactive stores.
//!
//! A [`Store`] maps entity keys to their current value.  Each key is a [`Watchable`], so
//! its value can be observed through a [`Watcher`], and the store as a whole has a version
//! which changes whenever any key changes.  All stores of an engine share one [`Notifier`]:
//! writes made while a dispatch batch is open result in a single notification per key.
//!
//! [`Derived`] values combine several stores and are only recomputed when one of their
//! dependencies changed since the last computation.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use futures_util::future::select_all;

use crate::watchable::{Notifier, Watchable, Watcher};

/// Values which can be shallowly merged with a partial update.
pub trait Merge<P> {
    /// Creates a value from a partial update, used when the key has no value yet.
    fn from_partial(partial: P) -> Self;

    /// Merges the fields present in `partial` into `self`.
    fn merge(&mut self, partial: P);
}

/// Something a [`Derived`] value can depend on.
pub trait Dependency: Send + Sync + 'static {
    /// Changes whenever the dependency changes.
    fn version(&self) -> u64;

    /// Watches the version.
    fn watch_version(&self) -> Watcher<u64>;
}

/// A keyed table of reactive values.
///
/// Cheaply clonable, all clones share the same entries.
pub struct Store<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

struct StoreInner<K, V> {
    entries: Mutex<BTreeMap<K, Watchable<Option<V>>>>,
    version: Watchable<u64>,
    notifier: Notifier,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.entries.lock().expect("poisoned");
        f.debug_struct("Store")
            .field("len", &entries.len())
            .field("version", &self.inner.version.get())
            .finish()
    }
}

impl<K, V> Store<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Creates an empty store notifying through `notifier`.
    pub fn new(notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(BTreeMap::new()),
                version: Watchable::with_notifier(0, notifier.clone()),
                notifier,
            }),
        }
    }

    /// Returns the handle for `key`, creating an empty entry if needed.
    pub fn key(&self, key: K) -> KeyHandle<K, V> {
        let value = self
            .inner
            .entries
            .lock()
            .expect("poisoned")
            .entry(key.clone())
            .or_insert_with(|| Watchable::with_notifier(None, self.inner.notifier.clone()))
            .clone();
        KeyHandle {
            key,
            value,
            store: self.clone(),
        }
    }

    /// The current value of `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.inner.entries.lock().expect("poisoned");
        entries.get(key).and_then(|value| value.get())
    }

    /// Sets the value of `key`, returns whether it changed.
    pub fn set(&self, key: K, value: V) -> bool {
        self.key(key).set(value)
    }

    /// Removes the value of `key`.
    ///
    /// Watchers of the key observe `None`.  Returns the removed value.
    pub fn remove(&self, key: &K) -> Option<V> {
        let value = self.inner.entries.lock().expect("poisoned").remove(key)?;
        let old = value.set(None).ok().flatten();
        if old.is_some() {
            self.bump();
        }
        old
    }

    /// Whether `key` currently has a value.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// All keys with a value.
    pub fn keys(&self) -> Vec<K> {
        let entries = self.inner.entries.lock().expect("poisoned");
        entries
            .iter()
            .filter(|(_, value)| value.get().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// All entries with a value.
    pub fn entries(&self) -> Vec<(K, V)> {
        let entries = self.inner.entries.lock().expect("poisoned");
        entries
            .iter()
            .filter_map(|(key, value)| value.get().map(|v| (key.clone(), v)))
            .collect()
    }

    /// The number of keys with a value.
    pub fn len(&self) -> usize {
        let entries = self.inner.entries.lock().expect("poisoned");
        entries.values().filter(|value| value.get().is_some()).count()
    }

    /// Whether no key has a value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watches the store as a whole, the version changes whenever any key changes.
    pub fn watch(&self) -> Watcher<u64> {
        self.inner.version.watch()
    }

    /// The notifier of this store.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    fn bump(&self) {
        self.inner.version.update(|version| *version += 1);
    }
}

impl<K, V> Dependency for Store<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    fn version(&self) -> u64 {
        self.inner.version.get()
    }

    fn watch_version(&self) -> Watcher<u64> {
        self.watch()
    }
}

/// Handle to a single key of a [`Store`].
pub struct KeyHandle<K, V> {
    key: K,
    value: Watchable<Option<V>>,
    store: Store<K, V>,
}

impl<K: fmt::Debug, V> fmt::Debug for KeyHandle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle").field("key", &self.key).finish()
    }
}

impl<K, V> KeyHandle<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// The key of this handle.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The current value.
    pub fn get(&self) -> Option<V> {
        self.value.get()
    }

    /// Sets the value, returns whether it changed.
    pub fn set(&self, value: V) -> bool {
        self.reattach();
        let changed = self.value.set(Some(value)).is_ok();
        if changed {
            self.store.bump();
        }
        changed
    }

    /// Modifies the value in place, or creates it from `init` if absent.
    ///
    /// Returns whether the value changed.
    pub fn update(&self, init: impl FnOnce() -> V, f: impl FnOnce(&mut V)) -> bool {
        self.reattach();
        let changed = self.value.update(|value| f(value.get_or_insert_with(init)));
        if changed {
            self.store.bump();
        }
        changed
    }

    /// Shallowly merges `partial` into the value, creating it if absent.
    pub fn merge<P>(&self, partial: P) -> bool
    where
        V: Merge<P>,
    {
        self.reattach();
        let changed = self.value.update(|value| match value {
            Some(value) => value.merge(partial),
            None => *value = Some(V::from_partial(partial)),
        });
        if changed {
            self.store.bump();
        }
        changed
    }

    /// Watches this key, dropping the watcher unsubscribes.
    pub fn subscribe(&self) -> Watcher<Option<V>> {
        self.value.watch()
    }

    /// Makes sure the entry is (still) part of the store, it might have been removed.
    fn reattach(&self) {
        let mut entries = self.store.inner.entries.lock().expect("poisoned");
        entries
            .entry(self.key.clone())
            .or_insert_with(|| self.value.clone());
    }
}

/// A value computed from other stores.
///
/// The value is computed lazily on [`Derived::get`] and cached until the version of any
/// dependency changes.
pub struct Derived<T> {
    inner: Arc<DerivedInner<T>>,
}

struct DerivedInner<T> {
    deps: Vec<Arc<dyn Dependency>>,
    combinator: Box<dyn Fn() -> T + Send + Sync>,
    cache: Mutex<Option<(Vec<u64>, T)>>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("deps", &self.inner.deps.len())
            .finish_non_exhaustive()
    }
}

/// Creates a [`Derived`] value from its dependencies and a combinator.
///
/// The combinator usually captures clones of the dependencies and reads them.
pub fn derived<T, F>(deps: Vec<Arc<dyn Dependency>>, combinator: F) -> Derived<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    Derived {
        inner: Arc::new(DerivedInner {
            deps,
            combinator: Box::new(combinator),
            cache: Mutex::new(None),
        }),
    }
}

impl<T: Clone + Send + Sync + 'static> Derived<T> {
    /// The current value, recomputed only if a dependency changed.
    pub fn get(&self) -> T {
        let versions = self.versions();
        let mut cache = self.inner.cache.lock().expect("poisoned");
        if let Some((cached_versions, value)) = cache.as_ref() {
            if *cached_versions == versions {
                return value.clone();
            }
        }
        let value = (self.inner.combinator)();
        *cache = Some((versions, value.clone()));
        value
    }

    /// Waits until any dependency changed and returns the new value.
    pub async fn updated(&self) -> T {
        let mut watchers: Vec<_> = self
            .inner
            .deps
            .iter()
            .map(|dep| dep.watch_version())
            .collect();
        if !watchers.is_empty() {
            let futs = watchers
                .iter_mut()
                .map(|watcher| Box::pin(watcher.updated()));
            select_all(futs).await;
        } else {
            std::future::pending::<()>().await;
        }
        self.get()
    }

    fn versions(&self) -> Vec<u64> {
        self.inner.deps.iter().map(|dep| dep.version()).collect()
    }
}
