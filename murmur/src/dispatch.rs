//! Routing records to the projections interested in them.
//!
//! The [`Dispatcher`] is a registry of [`Handler`]s keyed by record [`Kind`], plus global
//! handlers which see every record.  Handlers run sequentially in registration order, each
//! awaited before the next, so a projection never races another projection over the same
//! record.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{Arc, RwLock},
};

use murmur_base::{Event, Kind};
use murmur_relay::BoxFuture;
use tracing::trace;

/// Handles dispatched records.
pub trait Handler: Send + Sync + 'static {
    /// Handles a single record.
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()>;
}

impl<T: Handler> Handler for Arc<T> {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.as_ref().handle(event)
    }
}

impl<T: Handler> Handler for Box<T> {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.as_ref().handle(event)
    }
}

/// Wraps a closure as a [`Handler`].
#[derive(derive_more::Debug)]
#[debug("HandlerFn")]
pub struct HandlerFn<F>(F);

impl<F, Fut> HandlerFn<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Creates a handler calling `f` for every record.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        Box::pin((self.0)(event))
    }
}

/// The result of dispatching a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// At least one handler was registered for the record's kind.
    Handled {
        /// The number of kind handlers which ran.
        handlers: usize,
    },
    /// No handler is registered for the record's kind, only global handlers ran.
    Unhandled,
}

/// A registry of [`Handler`]s keyed by [`Kind`].
///
/// Cheaply clonable, all clones share the same registry.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    global: Vec<Arc<dyn Handler>>,
    by_kind: BTreeMap<Kind, Vec<Arc<dyn Handler>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.read().expect("poisoned");
        f.debug_struct("Dispatcher")
            .field("global", &registry.global.len())
            .field("kinds", &registry.by_kind.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for records of `kind`.
    pub fn add_handler(&self, kind: Kind, handler: impl Handler) {
        let mut registry = self.inner.write().expect("poisoned");
        registry
            .by_kind
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Registers a handler for all records.
    pub fn add_global_handler(&self, handler: impl Handler) {
        let mut registry = self.inner.write().expect("poisoned");
        registry.global.push(Arc::new(handler));
    }

    /// Whether any kind handler is registered for `kind`.
    pub fn handles(&self, kind: Kind) -> bool {
        let registry = self.inner.read().expect("poisoned");
        registry.by_kind.contains_key(&kind)
    }

    /// Runs all global handlers, then all handlers for the record's kind.
    pub async fn dispatch(&self, event: Arc<Event>) -> Dispatched {
        let (global, handlers) = {
            let registry = self.inner.read().expect("poisoned");
            (
                registry.global.clone(),
                registry.by_kind.get(&event.kind).cloned(),
            )
        };
        for handler in global {
            handler.handle(event.clone()).await;
        }
        let Some(handlers) = handlers else {
            trace!(kind = %event.kind, id = %event.id.fmt_short(), "no handler");
            return Dispatched::Unhandled;
        };
        for handler in &handlers {
            handler.handle(event.clone()).await;
        }
        Dispatched::Handled {
            handlers: handlers.len(),
        }
    }
}
