//! Selector model and canonicalization.
//!
//! A selector identifies a subset of a ledger's events and a position. The
//! same value serves as URL token, HTTP ETag basis, atomic-append predicate
//! and subscription key, so everything here is geared towards one stable
//! canonical form: sorted maps, validated limits, and a degenerate filter
//! collapsing back to a plain selector.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::event::EntityMap;
use crate::event_id::EventId;
use crate::jsonpath::JsonPath;

/// A JSONPath query plus its variable bindings.
///
/// Variable objects are backed by `serde_json`'s default map (sorted keys),
/// so serializing them is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPathFilter {
    pub query: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, Value>,
}

impl JsonPathFilter {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            vars: BTreeMap::new(),
        }
    }

    /// Whether the query is the trivial "match anything" path.
    pub fn is_match_all(&self) -> bool {
        self.query.trim() == "$"
    }

    fn validate(&self, context: &str) -> DomainResult<()> {
        JsonPath::parse(&self.query)
            .map_err(|e| DomainError::invalid_selector(format!("{context}: {e}")))?;
        Ok(())
    }
}

/// "All events from `after` exclusive, up to `limit`."
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlainSelector {
    pub after: Option<EventId>,
    pub limit: Option<u32>,
}

/// A plain selector plus any of the three filter clauses.
///
/// The selector matches an event when at least one specified clause does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSelector {
    pub after: Option<EventId>,
    pub limit: Option<u32>,
    pub entities: EntityMap,
    pub meta: Option<JsonPathFilter>,
    pub events: BTreeMap<String, JsonPathFilter>,
}

impl FilterSelector {
    pub fn has_clauses(&self) -> bool {
        !self.entities.is_empty() || self.meta.is_some() || !self.events.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Plain(PlainSelector),
    Filter(FilterSelector),
}

impl Selector {
    pub fn plain(after: Option<EventId>, limit: Option<u32>) -> Self {
        Self::Plain(PlainSelector { after, limit })
    }

    pub fn after(&self) -> Option<EventId> {
        match self {
            Self::Plain(s) => s.after,
            Self::Filter(s) => s.after,
        }
    }

    pub fn limit(&self) -> Option<u32> {
        match self {
            Self::Plain(s) => s.limit,
            Self::Filter(s) => s.limit,
        }
    }

    pub fn is_filter(&self) -> bool {
        matches!(self, Self::Filter(_))
    }

    /// The same selector advanced to a new position.
    pub fn with_after(&self, after: EventId) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::Plain(s) => s.after = Some(after),
            Self::Filter(s) => s.after = Some(after),
        }
        next
    }

    /// The same selector without a result bound (subscriptions store this).
    pub fn without_limit(&self) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::Plain(s) => s.limit = None,
            Self::Filter(s) => s.limit = None,
        }
        next
    }

    /// Validate and reduce to the idempotent stable form.
    ///
    /// Maps are already sorted by construction; what remains is rejecting
    /// invalid limits, empty entity key lists and unparsable queries, and
    /// collapsing a clause-less filter into a plain selector.
    pub fn canonicalize(self) -> DomainResult<Self> {
        if let Some(0) = self.limit() {
            return Err(DomainError::validation("limit must be greater than zero"));
        }
        match self {
            Self::Plain(s) => Ok(Self::Plain(s)),
            Self::Filter(s) => {
                for (name, keys) in &s.entities {
                    if keys.is_empty() {
                        return Err(DomainError::validation(format!(
                            "entity {name:?} has an empty key list"
                        )));
                    }
                }
                if let Some(meta) = &s.meta {
                    meta.validate("meta")?;
                }
                for (event, filter) in &s.events {
                    filter.validate(event)?;
                }
                if s.has_clauses() {
                    Ok(Self::Filter(s))
                } else {
                    Ok(Self::Plain(PlainSelector {
                        after: s.after,
                        limit: s.limit,
                    }))
                }
            }
        }
    }
}

// JSON document form used by the HTTP surface (`POST /selectors`, the inner
// append selector, subscriptions). Plain and filter selectors share one
// document; presence of any filter clause decides the variant.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    after: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(default, skip_serializing_if = "EntityMap::is_empty")]
    entities: EntityMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<JsonPathFilter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    events: BTreeMap<String, JsonPathFilter>,
}

impl From<SelectorDoc> for Selector {
    fn from(doc: SelectorDoc) -> Self {
        if doc.entities.is_empty() && doc.meta.is_none() && doc.events.is_empty() {
            Selector::Plain(PlainSelector {
                after: doc.after,
                limit: doc.limit,
            })
        } else {
            Selector::Filter(FilterSelector {
                after: doc.after,
                limit: doc.limit,
                entities: doc.entities,
                meta: doc.meta,
                events: doc.events,
            })
        }
    }
}

impl From<Selector> for SelectorDoc {
    fn from(selector: Selector) -> Self {
        match selector {
            Selector::Plain(s) => SelectorDoc {
                after: s.after,
                limit: s.limit,
                entities: EntityMap::new(),
                meta: None,
                events: BTreeMap::new(),
            },
            Selector::Filter(s) => SelectorDoc {
                after: s.after,
                limit: s.limit,
                entities: s.entities,
                meta: s.meta,
                events: s.events,
            },
        }
    }
}

impl Serialize for Selector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SelectorDoc::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        SelectorDoc::deserialize(deserializer).map(Selector::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clause_less_filter_collapses_to_plain() {
        let selector = Selector::Filter(FilterSelector::default())
            .canonicalize()
            .unwrap();
        assert!(matches!(selector, Selector::Plain(_)));
    }

    #[test]
    fn zero_limit_is_rejected() {
        let selector = Selector::plain(None, Some(0));
        assert!(selector.canonicalize().is_err());
    }

    #[test]
    fn empty_entity_key_list_is_rejected() {
        let selector = Selector::Filter(FilterSelector {
            entities: EntityMap::from([("order".into(), vec![])]),
            ..Default::default()
        });
        assert!(selector.canonicalize().is_err());
    }

    #[test]
    fn json_document_presence_of_clauses_selects_variant() {
        let plain: Selector = serde_json::from_value(json!({"limit": 3})).unwrap();
        assert!(!plain.is_filter());

        let filter: Selector =
            serde_json::from_value(json!({"entities": {"order": ["o-1"]}})).unwrap();
        assert!(filter.is_filter());
    }

    #[test]
    fn without_limit_drops_only_the_limit() {
        let selector: Selector = serde_json::from_value(json!({
            "entities": {"order": ["o-1"]},
            "limit": 10
        }))
        .unwrap();
        let stripped = selector.without_limit();
        assert_eq!(stripped.limit(), None);
        assert!(stripped.is_filter());
    }
}
