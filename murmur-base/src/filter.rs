//! Relay query filters.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{IgnoredAny, MapAccess, Visitor},
    ser::SerializeMap,
};

use crate::{Event, EventId, Kind, PublicKey, Timestamp};

/// A conjunctive query over records.
///
/// Every field that is set must match for a record to match the filter.  Several filters in
/// one subscription are combined disjunctively, see [`matches_any`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Filter {
    /// Record ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<BTreeSet<EventId>>,
    /// Record authors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<BTreeSet<PublicKey>>,
    /// Record kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<BTreeSet<Kind>>,
    /// Single letter tag filters, serialised as `"#e": [...]`.
    #[serde(flatten)]
    pub tags: TagFilters,
    /// Only records created at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<Timestamp>,
    /// Only records created at or before this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<Timestamp>,
    /// Maximum number of stored records the relay should return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Full text search, evaluated by relays supporting it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    /// An empty filter matching every record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a record id.
    pub fn id(mut self, id: EventId) -> Self {
        self.ids.get_or_insert_with(Default::default).insert(id);
        self
    }

    /// Adds several record ids.
    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids.get_or_insert_with(Default::default).extend(ids);
        self
    }

    /// Adds an author.
    pub fn author(mut self, author: PublicKey) -> Self {
        self.authors
            .get_or_insert_with(Default::default)
            .insert(author);
        self
    }

    /// Adds several authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors
            .get_or_insert_with(Default::default)
            .extend(authors);
        self
    }

    /// Adds a kind.
    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.get_or_insert_with(Default::default).insert(kind);
        self
    }

    /// Adds several kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds.get_or_insert_with(Default::default).extend(kinds);
        self
    }

    /// Adds values for a single letter tag.
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .0
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets the lower time bound.
    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the upper time bound.
    pub fn until(mut self, until: Timestamp) -> Self {
        self.until = Some(until);
        self
    }

    /// Sets the limit.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the search term.
    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Whether the record matches every constraint of this filter.
    ///
    /// `limit` only applies to stored records on the relay and is ignored here.  `search`
    /// is approximated with a case insensitive substring match on the content.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        for (name, values) in &self.tags.0 {
            let found = event
                .tags
                .iter()
                .filter(|tag| tag.single_letter() == Some(*name))
                .filter_map(|tag| tag.value())
                .any(|value| values.contains(value));
            if !found {
                return false;
            }
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

/// Whether the record matches at least one of the filters.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

/// Single letter tag constraints of a [`Filter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagFilters(pub BTreeMap<char, BTreeSet<String>>);

impl Serialize for TagFilters {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, values) in &self.0 {
            map.serialize_entry(&format!("#{name}"), values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TagFilters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TagFiltersVisitor;

        impl<'de> Visitor<'de> for TagFiltersVisitor {
            type Value = TagFilters;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of single letter tag filters")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut tags = BTreeMap::new();
                while let Some(key) = access.next_key::<String>()? {
                    let mut chars = key.chars();
                    match (chars.next(), chars.next(), chars.next()) {
                        (Some('#'), Some(name), None) if name.is_ascii_alphabetic() => {
                            let values: BTreeSet<String> = access.next_value()?;
                            tags.insert(name, values);
                        }
                        _ => {
                            access.next_value::<IgnoredAny>()?;
                        }
                    }
                }
                Ok(TagFilters(tags))
            }
        }

        deserializer.deserialize_map(TagFiltersVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventTemplate, SecretKey, Tag};

    fn event(kind: Kind, created_at: u64, tags: Vec<Tag>) -> Event {
        let key = SecretKey::from_bytes(&[1u8; 32]);
        let mut template =
            EventTemplate::new(kind, "Hello Murmur").created_at(Timestamp::from_secs(created_at));
        template.tags = tags;
        template.into_unsigned(key.public()).sign(&key)
    }

    #[test]
    fn test_filter_json_shape() {
        let key = SecretKey::from_bytes(&[1u8; 32]).public();
        let filter = Filter::new()
            .kind(Kind::TEXT_NOTE)
            .author(key)
            .tag('t', ["rust"])
            .since(Timestamp::from_secs(10))
            .limit(5);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["kinds"], serde_json::json!([1]));
        assert_eq!(json["#t"], serde_json::json!(["rust"]));
        assert_eq!(json["since"], serde_json::json!(10));
        assert_eq!(json["limit"], serde_json::json!(5));
        assert!(json.get("ids").is_none());

        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let filter: Filter =
            serde_json::from_str(r##"{"kinds":[0],"#p":[],"unknown":{"x":1},"#long":[1]}"##)
                .unwrap();
        assert_eq!(filter.kinds, Some([Kind::METADATA].into()));
        assert_eq!(filter.tags.0.len(), 1);
    }

    #[test]
    fn test_matches() {
        let e = event(Kind::TEXT_NOTE, 100, vec![Tag::new(["t", "rust"])]);

        assert!(Filter::new().matches(&e));
        assert!(Filter::new().kind(Kind::TEXT_NOTE).matches(&e));
        assert!(!Filter::new().kind(Kind::METADATA).matches(&e));
        assert!(Filter::new().since(Timestamp::from_secs(100)).matches(&e));
        assert!(!Filter::new().since(Timestamp::from_secs(101)).matches(&e));
        assert!(!Filter::new().until(Timestamp::from_secs(99)).matches(&e));
        assert!(Filter::new().tag('t', ["go", "rust"]).matches(&e));
        assert!(!Filter::new().tag('t', ["go"]).matches(&e));
        assert!(!Filter::new().tag('e', ["rust"]).matches(&e));
        assert!(Filter::new().search("murmur").matches(&e));
        assert!(Filter::new().id(e.id).matches(&e));
    }

    #[test]
    fn test_matches_any_is_disjunctive() {
        let e = event(Kind::TEXT_NOTE, 100, vec![]);
        let filters = [Filter::new().kind(Kind::METADATA), Filter::new().kind(Kind::TEXT_NOTE)];
        assert!(matches_any(&filters, &e));
        assert!(!matches_any(&filters[..1], &e));
        assert!(!matches_any(&[], &e));
    }
}
