//! Profiles, reduced from metadata records.

use std::sync::Arc;

use murmur_base::{Event, PublicKey, Timestamp};
use murmur_relay::BoxFuture;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::{
    cache::BoundedCache,
    dispatch::Handler,
    reconcile::{Lww, Reconcile, newest},
    storage::{SerializeSnafu, Storage, StorageError},
    store::KeyHandle,
};

/// Storage table of persisted profiles.
pub const PROFILES_TABLE: &str = "profiles";

/// An author's profile.
///
/// Every field is reconciled on its own: a metadata record only updates the fields it
/// contains, and only if it is newer than whatever wrote the field before.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Short name.
    pub name: Lww<String>,
    /// Longer name for display.
    pub display_name: Lww<String>,
    /// Free text.
    pub about: Lww<String>,
    /// Url of the avatar.
    pub picture: Lww<String>,
    /// Verified internet identifier.
    pub nip05: Lww<String>,
    /// Lightning address.
    pub lud16: Lww<String>,
}

/// The fields a single metadata record sets, parsed from its json content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[allow(missing_docs)]
    #[serde(default)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub display_name: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub about: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub picture: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub nip05: Option<String>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub lud16: Option<String>,
}

impl Reconcile for Profile {
    type Update = ProfileUpdate;

    fn apply(&mut self, timestamp: Timestamp, update: ProfileUpdate) -> bool {
        // Not short-circuiting, every field must see the update.
        let changed = [
            self.name.apply_opt(timestamp, update.name),
            self.display_name.apply_opt(timestamp, update.display_name),
            self.about.apply_opt(timestamp, update.about),
            self.picture.apply_opt(timestamp, update.picture),
            self.nip05.apply_opt(timestamp, update.nip05),
            self.lud16.apply_opt(timestamp, update.lud16),
        ];
        changed.contains(&true)
    }

    fn updated_at(&self) -> Timestamp {
        newest([
            self.name.updated_at(),
            self.display_name.updated_at(),
            self.about.updated_at(),
            self.picture.updated_at(),
            self.nip05.updated_at(),
            self.lud16.updated_at(),
        ])
    }
}

impl Profile {
    /// The best name to show for this profile.
    pub fn display(&self) -> Option<&str> {
        self.display_name
            .get()
            .or(self.name.get())
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// Reduces metadata records into [`Profile`]s.
#[derive(Debug, Clone)]
pub struct Profiles {
    cache: BoundedCache<PublicKey, Profile>,
    storage: Option<Arc<dyn Storage>>,
}

impl Profiles {
    pub(crate) fn new(
        cache: BoundedCache<PublicKey, Profile>,
        storage: Option<Arc<dyn Storage>>,
    ) -> Self {
        Self { cache, storage }
    }

    /// The current profile of `pubkey`.
    pub fn get(&self, pubkey: &PublicKey) -> Option<Profile> {
        self.cache.get(pubkey)
    }

    /// The reactive handle of `pubkey`'s profile.
    pub fn key(&self, pubkey: PublicKey) -> KeyHandle<PublicKey, Profile> {
        self.cache.key(pubkey)
    }

    /// The underlying cache.
    pub fn cache(&self) -> &BoundedCache<PublicKey, Profile> {
        &self.cache
    }

    /// Applies a metadata record.
    ///
    /// Returns whether the profile changed.  Records with malformed content are ignored.
    pub fn apply(&self, event: &Event) -> bool {
        let update: ProfileUpdate = match serde_json::from_str(&event.content) {
            Ok(update) => update,
            Err(err) => {
                debug!(id = %event.id.fmt_short(), "ignoring malformed profile: {err:#}");
                return false;
            }
        };
        self.cache.patch(event.pubkey, event.created_at, update)
    }

    /// Writes the profile of `pubkey` to storage.
    async fn persist(&self, pubkey: PublicKey) -> Result<(), StorageError> {
        let (Some(storage), Some(profile)) = (&self.storage, self.cache.store().get(&pubkey))
        else {
            return Ok(());
        };
        let value = serde_json::to_value(&profile).context(SerializeSnafu)?;
        storage
            .put(PROFILES_TABLE, &pubkey.to_string(), value)
            .await
    }

    /// Loads all persisted profiles into the cache.
    ///
    /// Returns the number of restored profiles.  Entries which can not be decoded are
    /// skipped.
    pub async fn restore(&self) -> Result<usize, StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let entries = storage.query(PROFILES_TABLE, Box::new(|_, _| true)).await?;
        let mut restored = 0;
        for (key, value) in entries {
            let Ok(pubkey) = key.parse::<PublicKey>() else {
                warn!(%key, "skipping profile with invalid key");
                continue;
            };
            let profile: Profile = match serde_json::from_value(value) {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(%key, "skipping undecodable profile: {err:#}");
                    continue;
                }
            };
            // Records received before the restore are newer than what was stored.
            let merged = match self.cache.store().get(&pubkey) {
                Some(mut current) => {
                    merge_profile(&mut current, profile);
                    current
                }
                None => profile,
            };
            self.cache.insert(pubkey, merged);
            restored += 1;
        }
        debug!(restored, "restored profiles");
        Ok(restored)
    }
}

/// Merges field by field, keeping the newer value of each.
fn merge_profile(into: &mut Profile, other: Profile) {
    fn field(into: &mut Lww<String>, other: Lww<String>) {
        let timestamp = other.updated_at();
        into.apply_opt(timestamp, other.get().cloned());
    }
    field(&mut into.name, other.name);
    field(&mut into.display_name, other.display_name);
    field(&mut into.about, other.about);
    field(&mut into.picture, other.picture);
    field(&mut into.nip05, other.nip05);
    field(&mut into.lud16, other.lud16);
}

impl Handler for Profiles {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move {
            if !this.apply(&event) {
                return;
            }
            if let Err(err) = this.persist(event.pubkey).await {
                warn!(pubkey = %event.pubkey.fmt_short(), "failed to persist profile: {err:#}");
            }
        })
    }
}
