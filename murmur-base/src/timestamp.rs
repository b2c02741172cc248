use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the unix epoch, as self-reported by the author of a record.
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::Debug,
    derive_more::From,
)]
#[serde(transparent)]
#[debug("{_0}")]
pub struct Timestamp(u64);

impl Timestamp {
    /// The earliest representable timestamp, used as the default for fields never written.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from seconds since the unix epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// The current wall clock time.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self(secs)
    }

    /// Seconds since the unix epoch.
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Adds a duration, saturating at the maximum.
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_secs()))
    }

    /// Subtracts a duration, saturating at [`Timestamp::ZERO`].
    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_secs()))
    }
}
