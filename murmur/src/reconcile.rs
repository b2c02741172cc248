//! Field-level last-writer-wins reconciliation.
//!
//! Records are immutable and arrive in any order, possibly more than once.  Entities derived
//! from them keep a timestamp per field, and a record only overwrites a field if it is
//! strictly newer than whatever wrote the field before.  Applying the same set of records
//! in any order, any number of times, yields the same entity.

use murmur_base::Timestamp;
use serde::{Deserialize, Serialize};

/// A single last-writer-wins field.
///
/// A field which was never written has the timestamp [`Timestamp::ZERO`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lww<T> {
    value: Option<T>,
    updated_at: Timestamp,
}

impl<T> Default for Lww<T> {
    fn default() -> Self {
        Self {
            value: None,
            updated_at: Timestamp::ZERO,
        }
    }
}

impl<T> Lww<T> {
    /// The current value, `None` if never written.
    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// When the current value was written.
    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Writes `value` if `timestamp` is strictly newer than the current value.
    ///
    /// Returns whether the field was written.
    pub fn apply(&mut self, timestamp: Timestamp, value: T) -> bool {
        if timestamp <= self.updated_at {
            return false;
        }
        self.value = Some(value);
        self.updated_at = timestamp;
        true
    }

    /// Writes `value` if it is present, see [`Lww::apply`].
    pub fn apply_opt(&mut self, timestamp: Timestamp, value: Option<T>) -> bool {
        match value {
            Some(value) => self.apply(timestamp, value),
            None => false,
        }
    }
}

/// An entity made of last-writer-wins fields.
pub trait Reconcile: Clone + Default {
    /// The fields a single record may update.
    type Update;

    /// Applies the update from a record created at `timestamp`.
    ///
    /// Every field of the update is only written if `timestamp` is strictly newer than
    /// the field's own timestamp.  Returns whether anything changed.
    fn apply(&mut self, timestamp: Timestamp, update: Self::Update) -> bool;

    /// The newest timestamp of any field.
    fn updated_at(&self) -> Timestamp;
}

/// Merges a record's update into the existing entity, creating it if absent.
pub fn reconcile<E: Reconcile>(existing: Option<&E>, timestamp: Timestamp, update: E::Update) -> E {
    let mut entity = existing.cloned().unwrap_or_default();
    entity.apply(timestamp, update);
    entity
}

/// The newest of the given timestamps, [`Timestamp::ZERO`] if there are none.
pub fn newest(timestamps: impl IntoIterator<Item = Timestamp>) -> Timestamp {
    timestamps.into_iter().max().unwrap_or(Timestamp::ZERO)
}
