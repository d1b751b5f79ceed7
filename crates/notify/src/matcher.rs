//! Selector → in-process predicate over a persisted event.
//!
//! Compiling happens once per subscription; matching happens on every
//! appended event, so the JSONPath queries are parsed up front. The
//! compiled predicate is the disjunction of the selector's clauses, the
//! same rule the database-side predicate applies.

use std::collections::BTreeMap;

use serde_json::Value;

use evently_core::{
    DomainResult, EntityMap, FilterSelector, JsonPath, JsonPathFilter, PersistedEvent, Selector,
};

pub struct Matcher {
    kind: Kind,
}

enum Kind {
    /// Plain selectors match every event.
    Always,
    Filter {
        entities: EntityMap,
        meta: Option<CompiledPath>,
        /// `None` means the per-event query was exactly `$`.
        events: BTreeMap<String, Option<CompiledPath>>,
    },
}

struct CompiledPath {
    path: JsonPath,
    vars: BTreeMap<String, Value>,
}

impl CompiledPath {
    fn compile(filter: &JsonPathFilter) -> DomainResult<Option<Self>> {
        if filter.is_match_all() {
            // `$` is always true; skip the engine entirely.
            return Ok(None);
        }
        Ok(Some(Self {
            path: JsonPath::parse(&filter.query)?,
            vars: filter.vars.clone(),
        }))
    }

    fn exists(&self, value: &Value) -> bool {
        self.path.exists(value, &self.vars)
    }
}

impl Matcher {
    pub fn compile(selector: &Selector) -> DomainResult<Self> {
        let kind = match selector {
            Selector::Plain(_) => Kind::Always,
            Selector::Filter(filter) => compile_filter(filter)?,
        };
        Ok(Self { kind })
    }

    pub fn matches(&self, event: &PersistedEvent) -> bool {
        match &self.kind {
            Kind::Always => true,
            Kind::Filter {
                entities,
                meta,
                events,
            } => {
                entities_intersect(entities, &event.entities)
                    || meta.as_ref().is_some_and(|path| path.exists(&event.meta))
                    || match events.get(&event.event) {
                        Some(None) => true,
                        Some(Some(path)) => path.exists(&event.data),
                        None => false,
                    }
            }
        }
    }
}

fn compile_filter(filter: &FilterSelector) -> DomainResult<Kind> {
    let meta = match &filter.meta {
        Some(meta) => CompiledPath::compile(meta)?,
        None => None,
    };
    let mut events = BTreeMap::new();
    for (name, event_filter) in &filter.events {
        events.insert(name.clone(), CompiledPath::compile(event_filter)?);
    }
    Ok(Kind::Filter {
        entities: filter.entities.clone(),
        meta,
        events,
    })
}

// Any (name, key) pair shared between selector and event.
fn entities_intersect(wanted: &EntityMap, present: &EntityMap) -> bool {
    wanted.iter().any(|(name, keys)| {
        present
            .get(name)
            .is_some_and(|event_keys| keys.iter().any(|k| event_keys.contains(k)))
    })
}
