//! Per-author application settings, stored as addressable application data records.

use std::sync::Arc;

use murmur_base::{Address, Event, Kind, PublicKey, Timestamp};
use murmur_relay::BoxFuture;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    dispatch::Handler,
    reconcile::{Lww, Reconcile},
    store::{KeyHandle, Store},
    watchable::Notifier,
};

/// A settings document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Setting {
    /// The raw content of the latest record.
    pub content: Lww<String>,
}

impl Reconcile for Setting {
    type Update = String;

    fn apply(&mut self, timestamp: Timestamp, update: String) -> bool {
        self.content.apply(timestamp, update)
    }

    fn updated_at(&self) -> Timestamp {
        self.content.updated_at()
    }
}

impl Setting {
    /// Decodes the content as json.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_str(self.content.get()?).ok()
    }
}

/// Reduces application data records into [`Setting`]s keyed by address.
#[derive(Debug, Clone)]
pub struct Settings {
    store: Store<Address, Setting>,
}

impl Settings {
    pub(crate) fn new(notifier: Notifier) -> Self {
        Self {
            store: Store::new(notifier),
        }
    }

    /// The settings document `identifier` of `pubkey`.
    pub fn get(&self, pubkey: PublicKey, identifier: &str) -> Option<Setting> {
        self.store
            .get(&Address::new(Kind::APP_DATA, pubkey, identifier))
    }

    /// The reactive handle of a settings document.
    pub fn key(&self, pubkey: PublicKey, identifier: &str) -> KeyHandle<Address, Setting> {
        self.store
            .key(Address::new(Kind::APP_DATA, pubkey, identifier))
    }

    /// Applies an application data record, returns whether the document changed.
    pub fn apply(&self, event: &Event) -> bool {
        if event.kind != Kind::APP_DATA {
            return false;
        }
        let Some(address) = event.address() else {
            return false;
        };
        if address.identifier.is_empty() {
            debug!(id = %event.id.fmt_short(), "ignoring settings without identifier");
            return false;
        }
        let created_at = event.created_at;
        let content = event.content.clone();
        self.store.key(address).update(Setting::default, |setting| {
            setting.apply(created_at, content);
        })
    }
}

impl Handler for Settings {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{EventTemplate, SecretKey, Tag};
    use serde::Deserialize;

    use super::*;

    fn app_data(key: &SecretKey, d: &str, content: &str, created_at: u64) -> Event {
        EventTemplate::new(Kind::APP_DATA, content)
            .tag(Tag::identifier(d))
            .created_at(Timestamp::from_secs(created_at))
            .into_unsigned(key.public())
            .sign(key)
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Theme {
        dark: bool,
    }

    #[test]
    fn test_settings_per_identifier() {
        let settings = Settings::new(Notifier::new());
        let alice = SecretKey::from_bytes(&[1u8; 32]);
        settings.apply(&app_data(&alice, "theme", r#"{"dark":true}"#, 20));
        settings.apply(&app_data(&alice, "theme", r#"{"dark":false}"#, 10));
        settings.apply(&app_data(&alice, "lang", r#""en""#, 10));

        let theme = settings.get(alice.public(), "theme").unwrap();
        assert_eq!(theme.decode::<Theme>(), Some(Theme { dark: true }));
        let lang = settings.get(alice.public(), "lang").unwrap();
        assert_eq!(lang.decode::<String>().as_deref(), Some("en"));
        assert!(settings.get(alice.public(), "missing").is_none());
    }

    #[test]
    fn test_missing_identifier_is_ignored() {
        let settings = Settings::new(Notifier::new());
        let alice = SecretKey::from_bytes(&[1u8; 32]);
        let event = EventTemplate::new(Kind::APP_DATA, "{}")
            .into_unsigned(alice.public())
            .sign(&alice);
        assert!(!settings.apply(&event));
    }
}
