//! The [`RelayActor`] owns one [`ConnActor`] per relay in use and routes [`Pool`] requests
//! to them.
//!
//! - It starts a new [`ConnActor`] for each relay named in a request.
//!   - The [`ConnActor`] exits when it was idle for too long, the next request for
//!     the same relay starts a new one.
//! - Requests spanning several relays are fanned out to each [`ConnActor`]
//!   independently, a relay which is not reachable never delays the others.
//! - Every sweep interval all [`ConnActor`]s are asked to recompute their quality and
//!   check whether they are idle.
//!
//! [`Pool`]: super::Pool

use std::{collections::BTreeMap, sync::Arc};

use murmur_base::{Event, Filter, RelayUrl};
use murmur_relay::{SeenCache, Transport};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use super::{
    ConnectionInfo, Listener, ListenerId, PoolOptions, RelayOutcome,
    conn::{ConnActor, ConnOptions, ConnMessage},
};
use crate::{
    signer::Signer,
    watchable::{Watchable, Watcher},
};

/// Capacity of the inbox of each [`ConnActor`].
const CONN_INBOX_CAPACITY: usize = 64;

/// Requests to the [`RelayActor`], sent by the [`Pool`](super::Pool).
#[derive(Debug)]
pub(super) enum PoolMessage {
    Connect {
        url: RelayUrl,
        reply: oneshot::Sender<Watcher<ConnectionInfo>>,
    },
    Subscribe {
        urls: Vec<RelayUrl>,
        filters: Vec<Filter>,
        listener: Listener,
    },
    Unsubscribe {
        listener: ListenerId,
    },
    Publish {
        urls: Vec<RelayUrl>,
        event: Arc<Event>,
        reply: mpsc::UnboundedSender<(RelayUrl, RelayOutcome)>,
    },
    Count {
        urls: Vec<RelayUrl>,
        filters: Vec<Filter>,
        reply: mpsc::UnboundedSender<(RelayUrl, u64)>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Disconnect {
        url: RelayUrl,
    },
}

/// Handle to one [`ConnActor`].
#[derive(Debug, Clone)]
struct ConnHandle {
    sender: mpsc::Sender<ConnMessage>,
    info: Watcher<ConnectionInfo>,
    stop: CancellationToken,
}

pub(super) struct RelayActor {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    options: PoolOptions,
    seen: SeenCache,
    ingress: mpsc::UnboundedSender<Arc<Event>>,
    /// One actor per relay in use, removed once it exits after idling.
    conns: BTreeMap<RelayUrl, ConnHandle>,
    conn_tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl RelayActor {
    pub(super) fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        options: PoolOptions,
        seen: SeenCache,
        ingress: mpsc::UnboundedSender<Arc<Event>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            signer,
            options,
            seen,
            ingress,
            conns: Default::default(),
            conn_tasks: JoinSet::new(),
            cancel,
        }
    }

    pub(super) async fn run(mut self, mut inbox: mpsc::Receiver<PoolMessage>) {
        let mut sweep = time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.reset(); // Skip the immediate tick

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("shutting down");
                    break;
                }
                Some(res) = self.conn_tasks.join_next() => {
                    if let Err(err) = res {
                        if err.is_panic() {
                            error!("relay connection panicked: {err:#}");
                        } else {
                            warn!("relay connection aborted: {err:#}");
                        }
                    }
                    self.reap_conns();
                }
                msg = inbox.recv() => {
                    let Some(msg) = msg else {
                        debug!("inbox dropped, shutting down");
                        break;
                    };
                    let cancel = self.cancel.child_token();
                    cancel.run_until_cancelled(self.handle_msg(msg)).await;
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
            }
        }

        if time::timeout(Duration::from_secs(3), self.close_conns())
            .await
            .is_err()
        {
            warn!("relay connections did not close in time");
        }
    }

    async fn handle_msg(&mut self, msg: PoolMessage) {
        match msg {
            PoolMessage::Connect { url, reply } => {
                let handle = self.conn_handle(url);
                reply.send(handle.info).ok();
            }
            PoolMessage::Subscribe {
                urls,
                filters,
                listener,
            } => {
                for url in urls {
                    let msg = ConnMessage::Subscribe {
                        filters: filters.clone(),
                        listener: listener.clone(),
                    };
                    self.send_to_conn(url, msg).await;
                }
            }
            PoolMessage::Unsubscribe { listener } => {
                for handle in self.conns.values() {
                    handle
                        .sender
                        .send(ConnMessage::Unsubscribe(listener))
                        .await
                        .ok();
                }
            }
            PoolMessage::Publish { urls, event, reply } => {
                for url in urls {
                    let msg = ConnMessage::Publish {
                        event: event.clone(),
                        reply: reply.clone(),
                    };
                    self.send_to_conn(url, msg).await;
                }
            }
            PoolMessage::Count {
                urls,
                filters,
                reply,
            } => {
                for url in urls {
                    let msg = ConnMessage::Count {
                        filters: filters.clone(),
                        reply: reply.clone(),
                    };
                    self.send_to_conn(url, msg).await;
                }
            }
            PoolMessage::Connections { reply } => {
                let infos = self
                    .conns
                    .values()
                    .filter_map(|handle| handle.info.get().ok())
                    .collect();
                reply.send(infos).ok();
            }
            PoolMessage::Disconnect { url } => {
                if let Some(handle) = self.conns.remove(&url) {
                    debug!(%url, "disconnecting relay");
                    handle.stop.cancel();
                }
                self.log_conns();
            }
        }
    }

    /// Sends a message to the [`ConnActor`] for `url`, starting it if needed.
    ///
    /// An actor which exited while the message was in flight is restarted.
    async fn send_to_conn(&mut self, url: RelayUrl, msg: ConnMessage) {
        let handle = self.conn_handle(url.clone());
        let Err(mpsc::error::SendError(msg)) = handle.sender.send(msg).await else {
            return;
        };
        debug!(%url, "ConnActor exited, restarting");
        self.conns.remove(&url);
        let handle = self.conn_handle(url);
        if handle.sender.send(msg).await.is_err() {
            warn!("dropped message, ConnActor closed");
        }
    }

    /// Returns the handle of the [`ConnActor`].
    fn conn_handle(&mut self, url: RelayUrl) -> ConnHandle {
        match self.conns.get(&url) {
            Some(handle) if !handle.sender.is_closed() => handle.clone(),
            _ => {
                let handle = self.spawn_conn(url.clone());
                self.conns.insert(url, handle.clone());
                self.log_conns();
                handle
            }
        }
    }

    fn spawn_conn(&mut self, url: RelayUrl) -> ConnHandle {
        debug!(%url, "adding relay connection");

        let (inbox_tx, inbox_rx) = mpsc::channel(CONN_INBOX_CAPACITY);
        let info = Watchable::new(ConnectionInfo::new(url.clone()));
        let stop = self.cancel.child_token();
        let span = info_span!("relay-conn", %url);
        let opts = ConnOptions {
            url,
            inbox: inbox_rx,
            transport: self.transport.clone(),
            signer: self.signer.clone(),
            options: self.options.clone(),
            seen: self.seen.clone(),
            ingress: self.ingress.clone(),
            info: info.clone(),
            stop: stop.clone(),
        };
        let actor = ConnActor::new(opts);
        self.conn_tasks.spawn(
            async move {
                actor.run().await;
            }
            .instrument(span),
        );
        ConnHandle {
            sender: inbox_tx,
            info: info.watch(),
            stop,
        }
    }

    /// Asks every [`ConnActor`] to recompute its quality and check for idleness.
    fn sweep(&mut self) {
        self.reap_conns();
        for (url, handle) in &self.conns {
            if let Err(err) = handle.sender.try_send(ConnMessage::Sweep) {
                debug!(%url, "skipping sweep: {err:#}");
            }
        }
    }

    /// Cleans up [`ConnActor`]s which have stopped running.
    fn reap_conns(&mut self) {
        let before = self.conns.len();
        self.conns.retain(|_, handle| !handle.sender.is_closed());
        if self.conns.len() != before {
            self.log_conns();
        }
    }

    /// Stops all [`ConnActor`]s and awaits for them to finish.
    async fn close_conns(&mut self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut self.conn_tasks);
        tasks.join_all().await;
        self.conns.clear();

        self.log_conns();
    }

    fn log_conns(&self) {
        let urls: Vec<_> = self.conns.keys().map(ToString::to_string).collect();
        debug!(count = urls.len(), ?urls, "relay connections changed");
    }
}
