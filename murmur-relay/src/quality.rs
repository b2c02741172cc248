//! Tracking the health of a relay connection.

use std::collections::{BTreeMap, VecDeque};

use murmur_base::EventId;
use tokio::time::{self, Duration, Instant};
use tracing::debug;

use crate::protos::message::SubscriptionId;

/// Number of most recent exchanges the quality score is computed from.
pub const QUALITY_WINDOW: usize = 20;

/// Exchanges taking longer than this are counted as slow.
pub const SLOW_EXCHANGE: Duration = Duration::from_secs(2);

/// Maximum time a relay has to answer an exchange before it is counted as failed.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A request which expects an answer from the relay.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Exchange {
    /// A published record, answered by `OK`.
    Publish(EventId),
    /// A subscription or count request, answered by `EOSE`, `COUNT` or `CLOSED`.
    Query(SubscriptionId),
}

/// How a single exchange with the relay went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Answered within [`SLOW_EXCHANGE`].
    Ok,
    /// Answered, but slowly.
    Slow,
    /// Not answered in time, or the connection was lost.
    Failed,
}

/// Tracks the recent exchanges on a single relay connection.
///
/// The quality score is the share of successful exchanges among the last
/// [`QUALITY_WINDOW`] ones, where a slow exchange counts half.  A connection without any
/// finished exchange has a perfect score.
#[derive(Debug)]
pub struct QualityTracker {
    window: VecDeque<ExchangeOutcome>,
    pending: BTreeMap<Exchange, Instant>,
    timeout: Duration,
}

impl Default for QualityTracker {
    fn default() -> Self {
        Self::new(EXCHANGE_TIMEOUT)
    }
}

impl QualityTracker {
    /// Creates a new tracker, failing exchanges which take longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            window: VecDeque::with_capacity(QUALITY_WINDOW),
            pending: BTreeMap::new(),
            timeout,
        }
    }

    /// Returns the timeout after which an exchange is failed.
    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    /// Starts tracking an exchange.
    ///
    /// Starting an exchange which is already pending restarts its clock.
    pub fn start(&mut self, exchange: Exchange) {
        self.pending.insert(exchange, Instant::now());
    }

    /// Whether the exchange is still waiting for an answer.
    pub fn is_pending(&self, exchange: &Exchange) -> bool {
        self.pending.contains_key(exchange)
    }

    /// Records the answer to an exchange.
    ///
    /// Answers to exchanges which are not pending are ignored and return `None`.
    pub fn finish(&mut self, exchange: &Exchange) -> Option<ExchangeOutcome> {
        let started = self.pending.remove(exchange)?;
        let outcome = if started.elapsed() > SLOW_EXCHANGE {
            ExchangeOutcome::Slow
        } else {
            ExchangeOutcome::Ok
        };
        self.record(outcome);
        Some(outcome)
    }

    /// Records a pending exchange as failed.
    pub fn fail(&mut self, exchange: &Exchange) {
        if self.pending.remove(exchange).is_some() {
            self.record(ExchangeOutcome::Failed);
        }
    }

    /// Stops tracking an exchange without recording an outcome.
    ///
    /// Used when the client itself abandons the exchange, e.g. closes a subscription
    /// before the relay finished sending stored records.
    pub fn cancel(&mut self, exchange: &Exchange) -> bool {
        self.pending.remove(exchange).is_some()
    }

    /// Fails all pending exchanges, e.g. because the connection was lost.
    pub fn fail_all(&mut self) -> Vec<Exchange> {
        let pending = std::mem::take(&mut self.pending);
        for _ in 0..pending.len() {
            self.record(ExchangeOutcome::Failed);
        }
        pending.into_keys().collect()
    }

    /// Records an outcome directly, e.g. a failed dial.
    pub fn record(&mut self, outcome: ExchangeOutcome) {
        if self.window.len() == QUALITY_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(outcome);
    }

    /// The current quality score, in `[0, 1]`.
    pub fn score(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let points: f64 = self
            .window
            .iter()
            .map(|outcome| match outcome {
                ExchangeOutcome::Ok => 1.0,
                ExchangeOutcome::Slow => 0.5,
                ExchangeOutcome::Failed => 0.0,
            })
            .sum();
        points / self.window.len() as f64
    }

    /// Cancel-safe waiting for the oldest pending exchange to time out.
    ///
    /// The timed out exchange is recorded as failed and returned.  Unless an exchange is
    /// pending, this will never return.
    pub async fn timeout(&mut self) -> Exchange {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, started)| **started)
            .map(|(exchange, started)| (exchange.clone(), *started));
        match oldest {
            Some((exchange, started)) => {
                time::sleep_until(started + self.timeout).await;
                debug!(?exchange, "exchange timeout");
                self.fail(&exchange);
                exchange
            }
            None => std::future::pending().await,
        }
    }
}
