//! Watchable values.
//!
//! A [`Watchable`] holds a value which changes over time, its [`Watcher`]s wake up when it
//! does.  Watchers only ever see the latest value, intermediate values may be skipped.
//!
//! Watchables sharing a [`Notifier`] can defer their notifications: while a [`Batch`] is
//! open, values change immediately but watchers are only woken once the batch closes, once
//! per watchable no matter how many times it was written.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, RwLock, Weak},
    task::{self, Poll, Waker},
};

use futures_lite::stream::Stream;
use snafu::Snafu;

const FIRST_EPOCH: u64 = 1;

/// The [`Watchable`] behind a [`Watcher`] was dropped.
#[derive(Debug, Snafu)]
#[snafu(display("watchable was dropped"))]
pub struct Disconnected {}

/// Something which publishes deferred changes when a [`Batch`] closes.
trait Publish: Send + Sync {
    fn publish(&self);
}

/// Coordinates deferred notifications of many [`Watchable`]s.
///
/// Cheaply clonable, all clones share the same batch state.
#[derive(Clone, Default)]
pub struct Notifier {
    inner: Arc<Mutex<NotifierState>>,
}

#[derive(Default)]
struct NotifierState {
    depth: usize,
    pending: Vec<Arc<dyn Publish>>,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock().expect("poisoned");
        f.debug_struct("Notifier")
            .field("depth", &state.depth)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Notifier {
    /// Creates a new notifier, not in a batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a batch, notifications are deferred until all open batches are dropped.
    ///
    /// Batches nest: only closing the outermost one notifies watchers.
    pub fn batch(&self) -> Batch {
        self.inner.lock().expect("poisoned").depth += 1;
        Batch {
            notifier: self.clone(),
        }
    }

    /// Whether a batch is currently open.
    pub fn in_batch(&self) -> bool {
        self.inner.lock().expect("poisoned").depth > 0
    }

    /// Queues `publisher` if a batch is open, returns `false` if it should publish now.
    fn defer(&self, publisher: Arc<dyn Publish>) -> bool {
        let mut state = self.inner.lock().expect("poisoned");
        if state.depth == 0 {
            return false;
        }
        state.pending.push(publisher);
        true
    }
}

/// An open notification batch, see [`Notifier::batch`].
#[derive(Debug)]
#[must_use = "notifications are released when the batch is dropped"]
pub struct Batch {
    notifier: Notifier,
}

impl Drop for Batch {
    fn drop(&mut self) {
        let pending = {
            let mut state = self.notifier.inner.lock().expect("poisoned");
            state.depth -= 1;
            if state.depth > 0 {
                return;
            }
            std::mem::take(&mut state.pending)
        };
        for publisher in pending {
            publisher.publish();
        }
    }
}

/// The shared state for a [`Watchable`].
#[derive(Debug)]
struct Shared<T> {
    state: RwLock<State<T>>,
    watchers: Mutex<VecDeque<Waker>>,
    notifier: Notifier,
}

#[derive(Debug)]
struct State<T> {
    value: T,
    /// Bumped each time watchers are notified.
    epoch: u64,
    /// The value changed since the last notification.
    dirty: bool,
}

impl<T: Clone> Shared<T> {
    fn get(&self) -> T {
        self.state.read().expect("poisoned").value.clone()
    }

    fn poll_since(&self, cx: &mut task::Context<'_>, last_epoch: u64) -> Poll<(u64, T)> {
        {
            let state = self.state.read().expect("poisoned");
            if last_epoch < state.epoch {
                return Poll::Ready((state.epoch, state.value.clone()));
            }
        }

        self.watchers
            .lock()
            .expect("poisoned")
            .push_back(cx.waker().to_owned());

        // Published between the first check and registering the waker.
        let state = self.state.read().expect("poisoned");
        if last_epoch < state.epoch {
            return Poll::Ready((state.epoch, state.value.clone()));
        }
        Poll::Pending
    }
}

impl<T: Send + Sync> Publish for Shared<T> {
    fn publish(&self) {
        {
            let mut state = self.state.write().expect("poisoned");
            if !state.dirty {
                return;
            }
            state.dirty = false;
            state.epoch += 1;
        }
        for watcher in self.watchers.lock().expect("poisoned").drain(..) {
            watcher.wake();
        }
    }
}

/// A shared value whose changes can be awaited by any number of [`Watcher`]s.
#[derive(Debug)]
pub struct Watchable<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Watchable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Default + Clone + PartialEq + Send + Sync + 'static> Default for Watchable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Watchable<T> {
    /// Creates an observable value which notifies immediately.
    pub fn new(value: T) -> Self {
        Self::with_notifier(value, Notifier::new())
    }

    /// Creates an observable value whose notifications are batched by `notifier`.
    pub fn with_notifier(value: T, notifier: Notifier) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    value,
                    epoch: FIRST_EPOCH,
                    dirty: false,
                }),
                watchers: Default::default(),
                notifier,
            }),
        }
    }

    /// Replaces the value, returning the previous one.
    ///
    /// An equal value is handed back as `Err` and nobody is notified.
    pub fn set(&self, value: T) -> Result<T, T> {
        let old = {
            let mut state = self.shared.state.write().expect("poisoned");
            if state.value == value {
                return Err(value);
            }
            state.dirty = true;
            std::mem::replace(&mut state.value, value)
        };
        self.changed();
        Ok(old)
    }

    /// Modifies the value in place, notifying watchers if it changed.
    ///
    /// Returns whether the value changed.
    pub fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        let changed = {
            let mut state = self.shared.state.write().expect("poisoned");
            let mut value = state.value.clone();
            f(&mut value);
            if value == state.value {
                false
            } else {
                state.value = value;
                state.dirty = true;
                true
            }
        };
        if changed {
            self.changed();
        }
        changed
    }

    fn changed(&self) {
        let publisher: Arc<dyn Publish> = self.shared.clone();
        if !self.shared.notifier.defer(publisher) {
            self.shared.publish();
        }
    }

    /// A new [`Watcher`] which has seen the current value.
    pub fn watch(&self) -> Watcher<T> {
        Watcher {
            epoch: self.shared.state.read().expect("poisoned").epoch,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// A clone of the current value.
    pub fn get(&self) -> T {
        self.shared.get()
    }

    /// The number of notifications sent so far.
    pub fn epoch(&self) -> u64 {
        self.shared.state.read().expect("poisoned").epoch
    }
}

/// Observes a [`Watchable`] without keeping it alive.
///
/// A watcher remembers the last epoch it saw, so it only ever yields the newest value and
/// never misses that a change happened.
#[derive(Debug, Clone)]
pub struct Watcher<T> {
    epoch: u64,
    shared: Weak<Shared<T>>,
}

impl<T: Clone> Watcher<T> {
    /// The current value, or [`Disconnected`] if the watchable is gone.
    pub fn get(&self) -> Result<T, Disconnected> {
        let shared = self.shared.upgrade().ok_or(Disconnected {})?;
        Ok(shared.get())
    }

    /// Resolves with the value once a newer one than last seen was published.
    pub fn updated(&mut self) -> impl Future<Output = Result<T, Disconnected>> + '_ {
        std::future::poll_fn(move |cx| self.poll_updated(cx))
    }

    fn poll_updated(&mut self, cx: &mut task::Context<'_>) -> Poll<Result<T, Disconnected>> {
        let Some(shared) = self.shared.upgrade() else {
            return Poll::Ready(Err(Disconnected {}));
        };
        shared.poll_since(cx, self.epoch).map(|(epoch, value)| {
            self.epoch = epoch;
            Ok(value)
        })
    }

    /// A stream starting with the current value, followed by every later published value.
    ///
    /// Values published while the stream is not polled are skipped in favour of the newest.
    pub fn stream(mut self) -> Changes<T> {
        self.epoch = self.epoch.saturating_sub(1);
        Changes { watcher: self }
    }

    /// Like [`Watcher::stream`] but without the current value.
    pub fn stream_updates_only(self) -> Changes<T> {
        Changes { watcher: self }
    }
}

/// Stream of the values of a [`Watchable`], ends when the watchable is dropped.
#[derive(Debug, Clone)]
pub struct Changes<T> {
    watcher: Watcher<T>,
}

impl<T: Clone> Stream for Changes<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<T>> {
        self.watcher.poll_updated(cx).map(Result::ok)
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::{StreamExt, future::poll_once};

    use super::*;

    #[tokio::test]
    async fn test_watcher() {
        let watchable = Watchable::new(17);
        assert_eq!(watchable.watch().stream().next().await.unwrap(), 17);

        let mut watcher = watchable.watch();
        assert!(watchable.set(17).is_err());
        assert!(poll_once(watcher.updated()).await.is_none());

        assert_eq!(watchable.set(18), Ok(17));
        assert_eq!(watcher.updated().await.unwrap(), 18);

        drop(watchable);
        assert!(watcher.get().is_err());
        assert!(watcher.updated().await.is_err());
    }

    #[tokio::test]
    async fn test_batch_coalesces() {
        let notifier = Notifier::new();
        let a = Watchable::with_notifier(0u32, notifier.clone());
        let b = Watchable::with_notifier(0u32, notifier.clone());
        let mut stream = a.watch().stream_updates_only();
        let mut watch_b = b.watch();

        {
            let _batch = notifier.batch();
            for i in 1..=5 {
                a.set(i).ok();
            }
            b.update(|v| *v += 1);
            // Values are visible immediately, but nobody was notified yet.
            assert_eq!(a.get(), 5);
            assert!(poll_once(stream.next()).await.is_none());
            assert!(poll_once(watch_b.updated()).await.is_none());
        }

        assert_eq!(stream.next().await, Some(5));
        assert!(poll_once(stream.next()).await.is_none());
        assert_eq!(watch_b.updated().await.unwrap(), 1);
        assert_eq!(a.epoch(), FIRST_EPOCH + 1);
    }

    #[test]
    fn test_nested_batches() {
        let notifier = Notifier::new();
        let value = Watchable::with_notifier(0u8, notifier.clone());
        let outer = notifier.batch();
        {
            let _inner = notifier.batch();
            value.set(1).ok();
        }
        assert!(notifier.in_batch());
        assert_eq!(value.epoch(), FIRST_EPOCH);
        drop(outer);
        assert!(!notifier.in_batch());
        assert_eq!(value.epoch(), FIRST_EPOCH + 1);
    }

    #[test]
    fn test_unchanged_update_does_not_notify() {
        let value = Watchable::new(vec![1u8]);
        assert!(!value.update(|v| v.sort()));
        assert_eq!(value.epoch(), FIRST_EPOCH);
        assert!(value.update(|v| v.push(2)));
        assert_eq!(value.epoch(), FIRST_EPOCH + 1);
    }
}
