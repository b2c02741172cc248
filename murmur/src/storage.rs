//! The persistence capability.
//!
//! [`Storage`] is a minimal table-oriented key-value interface, values are json.  The engine
//! uses it to persist reconciled entities and restore them on startup; it never depends on
//! the storage for correctness.  [`MemStorage`] keeps everything in memory.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use murmur_relay::BoxFuture;
use serde_json::Value;
use snafu::Snafu;

/// Errors of a [`Storage`] backend.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub))]
pub enum StorageError {
    #[snafu(display("unknown table {table}"))]
    UnknownTable { table: String },
    #[snafu(display("failed to serialize value"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("storage backend failed"))]
    Backend {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

/// A predicate over the entries of a table, used by [`Storage::query`].
pub type Predicate = Box<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Persistent, per-table key-value storage.
pub trait Storage: fmt::Debug + Send + Sync + 'static {
    /// Reads a single entry.
    fn get(&self, table: &str, key: &str) -> BoxFuture<Result<Option<Value>, StorageError>>;

    /// Writes a single entry, replacing any previous value.
    fn put(&self, table: &str, key: &str, value: Value) -> BoxFuture<Result<(), StorageError>>;

    /// Removes a single entry, returns whether it existed.
    fn delete(&self, table: &str, key: &str) -> BoxFuture<Result<bool, StorageError>>;

    /// Returns all entries of a table matching the predicate, ordered by key.
    fn query(
        &self,
        table: &str,
        predicate: Predicate,
    ) -> BoxFuture<Result<Vec<(String, Value)>, StorageError>>;
}

impl<T: Storage + ?Sized> Storage for Arc<T> {
    fn get(&self, table: &str, key: &str) -> BoxFuture<Result<Option<Value>, StorageError>> {
        self.as_ref().get(table, key)
    }

    fn put(&self, table: &str, key: &str, value: Value) -> BoxFuture<Result<(), StorageError>> {
        self.as_ref().put(table, key, value)
    }

    fn delete(&self, table: &str, key: &str) -> BoxFuture<Result<bool, StorageError>> {
        self.as_ref().delete(table, key)
    }

    fn query(
        &self,
        table: &str,
        predicate: Predicate,
    ) -> BoxFuture<Result<Vec<(String, Value)>, StorageError>> {
        self.as_ref().query(table, predicate)
    }
}

type Tables = BTreeMap<String, BTreeMap<String, Value>>;

/// In-memory [`Storage`].
///
/// Cheaply clonable, all clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    tables: Arc<Mutex<Tables>>,
}

impl MemStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of entries in a table.
    pub fn len(&self, table: &str) -> usize {
        let tables = self.tables.lock().expect("poisoned");
        tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().expect("poisoned");
        f(&mut tables)
    }
}

impl Storage for MemStorage {
    fn get(&self, table: &str, key: &str) -> BoxFuture<Result<Option<Value>, StorageError>> {
        let value = self.with(|tables| tables.get(table).and_then(|t| t.get(key)).cloned());
        Box::pin(async move { Ok(value) })
    }

    fn put(&self, table: &str, key: &str, value: Value) -> BoxFuture<Result<(), StorageError>> {
        self.with(|tables| {
            tables
                .entry(table.to_string())
                .or_default()
                .insert(key.to_string(), value)
        });
        Box::pin(async { Ok(()) })
    }

    fn delete(&self, table: &str, key: &str) -> BoxFuture<Result<bool, StorageError>> {
        let existed = self.with(|tables| {
            tables
                .get_mut(table)
                .and_then(|t| t.remove(key))
                .is_some()
        });
        Box::pin(async move { Ok(existed) })
    }

    fn query(
        &self,
        table: &str,
        predicate: Predicate,
    ) -> BoxFuture<Result<Vec<(String, Value)>, StorageError>> {
        let entries = self.with(|tables| {
            tables
                .get(table)
                .map(|t| {
                    t.iter()
                        .filter(|(k, v)| predicate(k, v))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
                .unwrap_or_default()
        });
        Box::pin(async move { Ok(entries) })
    }
}
