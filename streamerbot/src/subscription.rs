//! Client side bookkeeping of which events we want the server to send.

use crate::{
    catalog::EventCatalog,
    error::{Error, Result},
    message::EventEnvelope,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};
use tracing::warn;

const WILDCARD: &str = "*";

/// What a caller asks to (un)subscribe: everything, or a source -> types map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionSpec {
    All,
    Events(BTreeMap<String, BTreeSet<String>>),
}

impl Default for SubscriptionSpec {
    fn default() -> Self {
        SubscriptionSpec::Events(BTreeMap::new())
    }
}

impl SubscriptionSpec {
    pub fn all() -> Self {
        SubscriptionSpec::All
    }
    /// Adds `types` of `source`. Turns an `All` spec into an explicit one.
    pub fn with<I, T>(self, source: impl Into<String>, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut map = match self {
            SubscriptionSpec::All => BTreeMap::new(),
            SubscriptionSpec::Events(map) => map,
        };
        map.entry(source.into())
            .or_default()
            .extend(types.into_iter().map(Into::into));
        SubscriptionSpec::Events(map)
    }
    pub fn is_empty(&self) -> bool {
        match self {
            SubscriptionSpec::All => false,
            SubscriptionSpec::Events(map) => map.values().all(BTreeSet::is_empty),
        }
    }
    /// Expands the spec against `catalog`, dropping unknown sources with a warning.
    pub fn resolve(&self, catalog: &EventCatalog) -> SubscriptionSet {
        let mut set = SubscriptionSet::default();
        match self {
            SubscriptionSpec::All => {
                for (source, types) in catalog.iter() {
                    set.extend(source, types.iter().cloned());
                }
            }
            SubscriptionSpec::Events(map) => {
                for (source, types) in map {
                    if !catalog.contains_source(source) {
                        warn!(source = %source, "ignoring unknown event source");
                        continue;
                    }
                    set.extend(source, types.iter().cloned());
                }
            }
        }
        set
    }
}

impl Serialize for SubscriptionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SubscriptionSpec::All => serializer.serialize_str(WILDCARD),
            SubscriptionSpec::Events(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SubscriptionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Wildcard(String),
            Events(BTreeMap<String, BTreeSet<String>>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Wildcard(s) if s == WILDCARD => Ok(SubscriptionSpec::All),
            Repr::Wildcard(s) => Err(de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"\"*\" or a map of event sources to event types",
            )),
            Repr::Events(map) => Ok(SubscriptionSpec::Events(map)),
        }
    }
}

/// The accumulated subscription state. Sources never map to an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SubscriptionSet(BTreeMap<String, BTreeSet<String>>);

impl SubscriptionSet {
    /// Returns whether the pair was new.
    pub fn insert(&mut self, source: &str, kind: &str) -> bool {
        match self.0.get_mut(source) {
            Some(types) => types.insert(kind.to_owned()),
            None => {
                self.0
                    .insert(source.to_owned(), BTreeSet::from([kind.to_owned()]));
                true
            }
        }
    }
    /// Returns whether anything was added.
    pub fn extend<I: IntoIterator<Item = String>>(&mut self, source: &str, kinds: I) -> bool {
        let mut changed = false;
        for kind in kinds {
            changed |= self.insert(source, &kind);
        }
        changed
    }
    pub fn merge(&mut self, other: &SubscriptionSet) -> bool {
        let mut changed = false;
        for (source, types) in other.iter() {
            changed |= self.extend(source, types.iter().cloned());
        }
        changed
    }
    /// Returns whether the pair was present. Empty sources are pruned.
    pub fn remove(&mut self, source: &str, kind: &str) -> bool {
        let Some(types) = self.0.get_mut(source) else {
            return false;
        };
        let removed = types.remove(kind);
        if types.is_empty() {
            self.0.remove(source);
        }
        removed
    }
    pub fn remove_all(&mut self, other: &SubscriptionSet) {
        for (source, types) in other.iter() {
            for kind in types {
                self.remove(source, kind);
            }
        }
    }
    pub fn contains(&self, source: &str, kind: &str) -> bool {
        self.0.get(source).is_some_and(|types| types.contains(kind))
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.0
            .iter()
            .map(|(source, types)| (source.as_str(), types))
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// Number of (source, type) pairs.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }
}

impl From<SubscriptionSet> for SubscriptionSpec {
    fn from(value: SubscriptionSet) -> Self {
        SubscriptionSpec::Events(value.0)
    }
}

/// A listener pattern: `*`, `Source.*` or `Source.Type`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventPattern {
    All,
    Source(String),
    Exact { source: String, kind: String },
}

impl EventPattern {
    pub fn exact(source: impl Into<String>, kind: impl Into<String>) -> Self {
        EventPattern::Exact {
            source: source.into(),
            kind: kind.into(),
        }
    }
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        match self {
            EventPattern::All => true,
            EventPattern::Source(source) => *source == envelope.source,
            EventPattern::Exact { source, kind } => {
                *source == envelope.source && *kind == envelope.kind
            }
        }
    }
    /// Adds the events this pattern stands for to `set`.
    ///
    /// Wildcards expand to whatever `catalog` currently lists, so the result
    /// depends on the catalog at fold time.
    pub fn fold_into(&self, set: &mut SubscriptionSet, catalog: &EventCatalog) -> bool {
        match self {
            EventPattern::All => set.merge(&SubscriptionSpec::All.resolve(catalog)),
            EventPattern::Source(source) => match catalog.types(source) {
                Some(types) => set.extend(source, types.iter().cloned()),
                None => {
                    warn!(source = %source, "ignoring pattern for unknown event source");
                    false
                }
            },
            EventPattern::Exact { source, kind } => {
                if catalog.contains_source(source) {
                    set.insert(source, kind)
                } else {
                    warn!(source = %source, "ignoring pattern for unknown event source");
                    false
                }
            }
        }
    }
}

impl FromStr for EventPattern {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        if s == WILDCARD {
            return Ok(EventPattern::All);
        }
        match s.split_once('.') {
            Some((source, _)) if source.is_empty() || source == WILDCARD => {
                Err(Error::InvalidEventPattern(s.to_owned()))
            }
            Some((source, WILDCARD)) => Ok(EventPattern::Source(source.to_owned())),
            Some((source, kind)) if !kind.is_empty() => Ok(EventPattern::exact(source, kind)),
            _ => Err(Error::InvalidEventPattern(s.to_owned())),
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPattern::All => f.write_str(WILDCARD),
            EventPattern::Source(source) => write!(f, "{source}.*"),
            EventPattern::Exact { source, kind } => write!(f, "{source}.{kind}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalog() -> EventCatalog {
        [
            ("Twitch", vec!["Follow", "Cheer", "Raid"]),
            ("General", vec!["Custom"]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn subscribing_twice_is_idempotent() {
        let spec = SubscriptionSpec::default().with("Twitch", ["Follow", "Cheer"]);
        let mut once = SubscriptionSet::default();
        once.merge(&spec.resolve(&catalog()));
        let mut twice = once.clone();
        assert!(!twice.merge(&spec.resolve(&catalog())));
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn unknown_sources_are_dropped() {
        let spec = SubscriptionSpec::default()
            .with("Twitch", ["Follow"])
            .with("Nope", ["Thing"]);
        let set = spec.resolve(&catalog());
        assert!(set.contains("Twitch", "Follow"));
        assert_eq!(set.iter().count(), 1);
    }

    #[test]
    fn wildcard_spec_is_the_whole_catalog() {
        let set = SubscriptionSpec::All.resolve(&catalog());
        assert_eq!(set.len(), 4);
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            serde_json::to_value(catalog()).unwrap()
        );
    }

    #[test]
    fn remove_only_touches_named_types_and_prunes() {
        let mut set = SubscriptionSpec::All.resolve(&catalog());
        assert!(set.remove("Twitch", "Follow"));
        assert!(!set.remove("Twitch", "Follow"));
        assert!(set.contains("Twitch", "Cheer"));
        assert!(set.remove("General", "Custom"));
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!({ "Twitch": ["Cheer", "Raid"] })
        );
    }

    #[test]
    fn spec_serde() {
        let all: SubscriptionSpec = serde_json::from_value(json!("*")).unwrap();
        assert_eq!(all, SubscriptionSpec::All);
        let events: SubscriptionSpec =
            serde_json::from_value(json!({ "Twitch": ["Follow"] })).unwrap();
        assert_eq!(
            events,
            SubscriptionSpec::default().with("Twitch", ["Follow"])
        );
        assert!(serde_json::from_value::<SubscriptionSpec>(json!("Twitch")).is_err());
        assert_eq!(
            serde_json::to_value(SubscriptionSpec::All).unwrap(),
            json!("*")
        );
    }

    #[test]
    fn pattern_parsing() {
        assert_eq!("*".parse::<EventPattern>().unwrap(), EventPattern::All);
        assert_eq!(
            "Twitch.*".parse::<EventPattern>().unwrap(),
            EventPattern::Source("Twitch".into())
        );
        assert_eq!(
            "Twitch.Follow".parse::<EventPattern>().unwrap(),
            EventPattern::exact("Twitch", "Follow")
        );
        for bad in ["", "Twitch", ".Follow", "Twitch.", "*.Follow"] {
            assert!(
                bad.parse::<EventPattern>().is_err(),
                "{bad:?} should not parse"
            );
        }
        assert_eq!(EventPattern::exact("A", "B").to_string(), "A.B");
    }

    #[test]
    fn pattern_matching() {
        let follow = EventEnvelope::new("Twitch", "Follow");
        let cheer = EventEnvelope::new("Twitch", "Cheer");
        let custom = EventEnvelope::new("General", "Custom");
        let exact = EventPattern::exact("Twitch", "Follow");
        assert!(exact.matches(&follow));
        assert!(!exact.matches(&cheer));
        let source = EventPattern::Source("Twitch".into());
        assert!(source.matches(&cheer));
        assert!(!source.matches(&custom));
        assert!(EventPattern::All.matches(&custom));
    }

    #[test]
    fn source_wildcard_expands_against_current_catalog() {
        let pattern = EventPattern::Source("Twitch".into());
        let mut set = SubscriptionSet::default();
        assert!(pattern.fold_into(&mut set, &catalog()));
        assert_eq!(set.len(), 3);

        let grown: EventCatalog = [("Twitch", vec!["Follow", "Cheer", "Raid", "Sub"])]
            .into_iter()
            .collect();
        assert!(pattern.fold_into(&mut set, &grown));
        assert!(set.contains("Twitch", "Sub"));
    }

    #[test]
    fn exact_pattern_for_unknown_source_is_ignored() {
        let mut set = SubscriptionSet::default();
        assert!(!EventPattern::exact("Nope", "Thing").fold_into(&mut set, &catalog()));
        assert!(set.is_empty());
    }
}
