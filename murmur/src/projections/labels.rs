//! Labels attached to records, addresses and authors by label records.

use std::{collections::BTreeSet, sync::Arc};

use murmur_base::{Address, Event, EventId, Kind, PublicKey};
use murmur_relay::BoxFuture;
use tracing::trace;

use super::parse_pubkey;
use crate::{dispatch::Handler, store::Store, watchable::Notifier};

/// Namespace of labels which name none.
pub const DEFAULT_NAMESPACE: &str = "ugc";

/// What a label is attached to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LabelTarget {
    /// A single record.
    Event(EventId),
    /// A replaceable or addressable record.
    Address(Address),
    /// An author.
    Pubkey(PublicKey),
}

/// A label, as applied by one author.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    /// The namespace the value belongs to.
    pub namespace: String,
    /// The label itself.
    pub value: String,
    /// Who applied the label.
    pub author: PublicKey,
}

/// Reduces label records into the set of [`Label`]s per target.
#[derive(Debug, Clone)]
pub struct Labels {
    labels: Store<LabelTarget, BTreeSet<Label>>,
}

impl Labels {
    pub(crate) fn new(notifier: Notifier) -> Self {
        Self {
            labels: Store::new(notifier),
        }
    }

    /// All labels attached to `target`.
    pub fn get(&self, target: &LabelTarget) -> BTreeSet<Label> {
        self.labels.get(target).unwrap_or_default()
    }

    /// The labels attached to `target` within `namespace`.
    pub fn in_namespace(&self, target: &LabelTarget, namespace: &str) -> Vec<Label> {
        self.get(target)
            .into_iter()
            .filter(|label| label.namespace == namespace)
            .collect()
    }

    /// The labels by target.
    pub fn store(&self) -> &Store<LabelTarget, BTreeSet<Label>> {
        &self.labels
    }

    /// Applies a label record, returns the number of targets which changed.
    pub fn apply(&self, event: &Event) -> usize {
        if event.kind != Kind::LABEL {
            return 0;
        }
        let labels = labels(event);
        if labels.is_empty() {
            return 0;
        }
        targets(event)
            .into_iter()
            .filter(|target| {
                trace!(?target, count = labels.len(), "labels");
                self.labels.key(target.clone()).update(BTreeSet::new, |set| {
                    set.extend(labels.iter().cloned())
                })
            })
            .count()
    }
}

fn labels(event: &Event) -> Vec<Label> {
    let namespaces: Vec<&str> = event.tag_values("L").collect();
    let fallback = match namespaces.as_slice() {
        [namespace] => *namespace,
        _ => DEFAULT_NAMESPACE,
    };
    event
        .tags
        .iter()
        .filter(|tag| tag.name() == Some("l"))
        .filter_map(|tag| {
            let parts = tag.as_slice();
            let value = parts.get(1)?;
            let namespace = parts.get(2).map(String::as_str).unwrap_or(fallback);
            Some(Label {
                namespace: namespace.to_string(),
                value: value.clone(),
                author: event.pubkey,
            })
        })
        .collect()
}

fn targets(event: &Event) -> Vec<LabelTarget> {
    let events = event
        .tag_values("e")
        .filter_map(|value| value.parse().ok())
        .map(LabelTarget::Event);
    let addresses = event
        .tag_values("a")
        .filter_map(|value| value.parse().ok())
        .map(LabelTarget::Address);
    let pubkeys = event
        .tag_values("p")
        .filter_map(parse_pubkey)
        .map(LabelTarget::Pubkey);
    events.chain(addresses).chain(pubkeys).collect()
}

impl Handler for Labels {
    fn handle(&self, event: Arc<Event>) -> BoxFuture<()> {
        self.apply(&event);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use murmur_base::{EventTemplate, SecretKey, Tag};

    use super::*;

    fn key(i: u8) -> SecretKey {
        SecretKey::from_bytes(&[i; 32])
    }

    #[test]
    fn test_labels_per_target() {
        let labels = Labels::new(Notifier::new());
        let author = key(1);
        let labelled = key(2).public();
        let note = EventId::from_bytes([7u8; 32]);

        let event = EventTemplate::new(Kind::LABEL, "")
            .tag(Tag::new(["L", "#lang"]))
            .tag(Tag::new(["l", "en"]))
            .tag(Tag::new(["l", "spam", "moderation"]))
            .tag(Tag::event(note))
            .tag(Tag::pubkey(&labelled))
            .into_unsigned(author.public())
            .sign(&author);
        assert_eq!(labels.apply(&event), 2);
        // Applying the same record again changes nothing.
        assert_eq!(labels.apply(&event), 0);

        let on_note = labels.get(&LabelTarget::Event(note));
        assert_eq!(on_note.len(), 2);
        let lang = labels.in_namespace(&LabelTarget::Pubkey(labelled), "#lang");
        assert_eq!(lang.len(), 1);
        assert_eq!(lang[0].value, "en");
        assert_eq!(lang[0].author, author.public());
    }

    #[test]
    fn test_default_namespace() {
        let labels = Labels::new(Notifier::new());
        let author = key(1);
        let note = EventId::from_bytes([7u8; 32]);
        let event = EventTemplate::new(Kind::LABEL, "")
            .tag(Tag::new(["l", "interesting"]))
            .tag(Tag::event(note))
            .into_unsigned(author.public())
            .sign(&author);
        labels.apply(&event);
        let ugc = labels.in_namespace(&LabelTarget::Event(note), DEFAULT_NAMESPACE);
        assert_eq!(ugc.len(), 1);
    }
}
