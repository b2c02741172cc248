//! Default values used when talking to relays.

/// The default capacity of the cache of recently received record ids.
///
/// A record id and the relays it was seen on take roughly 64 bytes, so the cache stays
/// below a megabyte.
pub const DEFAULT_SEEN_CACHE_CAPACITY: usize = 10_000;

/// The default quality score below which a connection is considered degraded.
pub const DEFAULT_DEGRADED_THRESHOLD: f64 = 0.5;

/// Contains all timeouts used when talking to relays.
pub mod timeouts {
    use std::time::Duration;

    /// Timeout for establishing a connection to a relay, including the websocket upgrade.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Maximum time a relay has to acknowledge a published record.
    pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

    /// Maximum time a relay has to answer a count request.
    pub const COUNT_TIMEOUT: Duration = Duration::from_secs(3);

    /// Time after which a connection without any traffic or subscriptions is closed.
    pub const INACTIVE_TIMEOUT: Duration = Duration::from_secs(60);
}
