//! The batching worker.
//!
//! Inbound records arrive one at a time from many relays.  Handing each of them to the
//! projections individually would starve the rest of the application, so the [`Worker`]
//! queues them and flushes bounded batches on a timer: a tick is scheduled `delay` after
//! the buffer became non-empty, each tick delivers at most `batch_size` items, in order, to
//! every registered [`Consumer`].  Pushing never blocks and never delivers synchronously.

use std::{collections::VecDeque, fmt, future::Future, pin::pin, sync::Arc};

use murmur_relay::BoxFuture;
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, info_span, trace};

use crate::util::MaybeFuture;

/// Default maximum number of items delivered per tick.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default delay between an item being pushed and the tick delivering it.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(50);

/// Receives the batches flushed by a [`Worker`].
///
/// A consumer's batch is awaited before the next batch is flushed.
pub trait Consumer<T>: Send + Sync + 'static {
    /// Handles one batch.
    fn consume(&self, batch: Arc<[T]>) -> BoxFuture<()>;
}

impl<T, F, Fut> Consumer<T> for F
where
    F: Fn(Arc<[T]>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn consume(&self, batch: Arc<[T]>) -> BoxFuture<()> {
        Box::pin((self)(batch))
    }
}

/// Options for a [`Worker`].
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Maximum number of items per batch.
    pub batch_size: usize,
    /// Delay before a scheduled tick.
    pub delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            delay: DEFAULT_BATCH_DELAY,
        }
    }
}

enum WorkerMessage<T> {
    Push(T),
    AddConsumer(Box<dyn Consumer<T>>),
}

impl<T> fmt::Debug for WorkerMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push(_) => write!(f, "Push"),
            Self::AddConsumer(_) => write!(f, "AddConsumer"),
        }
    }
}

/// A bounded-delay batching queue.
///
/// Cheaply clonable, the worker task stops when the last clone is dropped.
#[derive(Debug)]
pub struct Worker<T> {
    inner: Arc<WorkerInner<T>>,
}

#[derive(Debug)]
struct WorkerInner<T> {
    tx: mpsc::UnboundedSender<WorkerMessage<T>>,
    cancel: CancellationToken,
    _task: AbortOnDropHandle<()>,
}

impl<T> Clone for Worker<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Worker<T> {
    /// Spawns a new worker task.
    pub fn spawn(options: WorkerOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let actor = WorkerActor {
            inbox: rx,
            buffer: VecDeque::new(),
            consumers: Vec::new(),
            options,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run().instrument(info_span!("worker")));
        Self {
            inner: Arc::new(WorkerInner {
                tx,
                cancel,
                _task: AbortOnDropHandle::new(task),
            }),
        }
    }

    /// Queues an item, never blocks.
    ///
    /// Returns `false` if the worker was shut down and the item was dropped.
    pub fn push(&self, item: T) -> bool {
        self.inner.tx.send(WorkerMessage::Push(item)).is_ok()
    }

    /// Registers a consumer for all batches flushed from now on.
    pub fn add_consumer(&self, consumer: impl Consumer<T>) {
        self.inner
            .tx
            .send(WorkerMessage::AddConsumer(Box::new(consumer)))
            .ok();
    }

    /// Stops the worker, queued items are dropped.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

struct WorkerActor<T> {
    inbox: mpsc::UnboundedReceiver<WorkerMessage<T>>,
    buffer: VecDeque<T>,
    consumers: Vec<Box<dyn Consumer<T>>>,
    options: WorkerOptions,
    cancel: CancellationToken,
}

impl<T: Send + Sync + 'static> WorkerActor<T> {
    async fn run(mut self) {
        let mut tick = pin!(MaybeFuture::idle());
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("shutting down");
                    break;
                }
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("all handles dropped, shutting down");
                        break;
                    };
                    match msg {
                        WorkerMessage::Push(item) => {
                            self.buffer.push_back(item);
                            if !tick.is_armed() {
                                tick.as_mut().arm(time::sleep(self.options.delay));
                            }
                        }
                        WorkerMessage::AddConsumer(consumer) => self.consumers.push(consumer),
                    }
                }
                _ = &mut tick, if tick.is_armed() => {
                    tick.as_mut().disarm();
                    self.flush().await;
                    if !self.buffer.is_empty() {
                        tick.as_mut().arm(time::sleep(self.options.delay));
                    }
                }
            }
        }
    }

    async fn flush(&mut self) {
        let len = self.buffer.len().min(self.options.batch_size.max(1));
        let batch: Arc<[T]> = self.buffer.drain(..len).collect();
        trace!(len, remaining = self.buffer.len(), "flushing batch");
        for consumer in &self.consumers {
            consumer.consume(batch.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    /// Records every delivered batch with the time it was delivered.
    fn recorder() -> (
        Arc<Mutex<Vec<(Instant, Vec<u32>)>>>,
        impl Consumer<u32>,
    ) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let batches = batches.clone();
            move |batch: Arc<[u32]>| {
                batches
                    .lock()
                    .unwrap()
                    .push((Instant::now(), batch.to_vec()));
                async {}
            }
        };
        (batches, consumer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_split_into_ticks() {
        let worker = Worker::spawn(WorkerOptions::default());
        let (batches, consumer) = recorder();
        worker.add_consumer(consumer);

        let start = Instant::now();
        for i in 0..120 {
            assert!(worker.push(i));
        }
        // Nothing is delivered synchronously.
        tokio::task::yield_now().await;
        assert!(batches.lock().unwrap().is_empty());

        time::sleep(Duration::from_secs(1)).await;
        let batches = batches.lock().unwrap();
        let sizes: Vec<usize> = batches.iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![50, 50, 20]);

        // Each drain happened on its own tick.
        let times: Vec<Duration> = batches.iter().map(|(t, _)| *t - start).collect();
        assert_eq!(
            times,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(150)
            ]
        );

        // FIFO.
        let all: Vec<u32> = batches.iter().flat_map(|(_, b)| b.clone()).collect();
        assert_eq!(all, (0..120).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tick_when_empty() {
        let worker = Worker::spawn(WorkerOptions::default());
        let (batches, consumer) = recorder();
        worker.add_consumer(consumer);

        worker.push(1);
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(batches.lock().unwrap().len(), 1);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(batches.lock().unwrap().len(), 1);

        let later = Instant::now();
        worker.push(2);
        time::sleep(Duration::from_millis(60)).await;
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].0 - later, Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_items() {
        let worker = Worker::spawn(WorkerOptions::default());
        let (batches, consumer) = recorder();
        worker.add_consumer(consumer);
        worker.push(1);
        worker.shutdown();
        time::sleep(Duration::from_secs(1)).await;
        assert!(batches.lock().unwrap().is_empty());
        assert!(!worker.push(2));
    }
}
