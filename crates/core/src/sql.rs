//! Selector → SQL predicate text.
//!
//! The database never parses the predicate bytes; it splices them into a
//! `WHERE` clause and also compares them byte-for-byte to detect append
//! races. Generation therefore has to be deterministic: clauses and their
//! members are emitted in the model's sorted order and nothing here depends
//! on formatting options. All string interpolation escapes single quotes by
//! doubling, matching the database's literal form.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::selector::{FilterSelector, JsonPathFilter, Selector};

/// Predicate matching every event (plain selectors).
pub const MATCH_ALL: &str = "true";

/// Predicate matching no event (factual appends skip the race check).
pub const MATCH_NONE: &str = "false";

/// Generate the SQL predicate for a selector.
pub fn predicate(selector: &Selector) -> String {
    match selector {
        Selector::Plain(_) => MATCH_ALL.to_string(),
        Selector::Filter(filter) => filter_predicate(filter),
    }
}

/// Predicate bytes as sent to the database.
pub fn predicate_bytes(selector: &Selector) -> Vec<u8> {
    predicate(selector).into_bytes()
}

// The three clauses are alternatives: an event matches the selector when
// any one of them matches it (same rule the in-process matcher applies).
fn filter_predicate(filter: &FilterSelector) -> String {
    let mut clauses = Vec::new();
    if !filter.entities.is_empty() {
        clauses.push(entities_clause(&filter.entities));
    }
    if let Some(meta) = &filter.meta {
        clauses.push(path_clause("meta", meta));
    }
    if !filter.events.is_empty() {
        clauses.push(events_clause(&filter.events));
    }
    match clauses.len() {
        0 => MATCH_ALL.to_string(),
        _ => format!("({})", clauses.join(" OR ")),
    }
}

// One `@?` path-exists test per entity name (rides the GIN index), e.g.
//   entities @? '$."order" ? (@=="o-1" || @=="o-2")'
fn entities_clause(entities: &BTreeMap<String, Vec<String>>) -> String {
    let terms: Vec<String> = entities
        .iter()
        .map(|(name, keys)| {
            let alternatives: Vec<String> = keys
                .iter()
                .map(|key| format!("@=={}", json_string(key)))
                .collect();
            let path = format!("$.{} ? ({})", json_string(name), alternatives.join(" || "));
            format!("entities @? '{}'", escape_literal(&path))
        })
        .collect();
    group(terms)
}

fn path_clause(column: &str, filter: &JsonPathFilter) -> String {
    if filter.vars.is_empty() {
        format!("{column} @? '{}'", escape_literal(&filter.query))
    } else {
        let vars = serde_json::to_string(&filter.vars).expect("vars serialize");
        format!(
            "jsonb_path_exists({column}, '{}', '{}')",
            escape_literal(&filter.query),
            escape_literal(&vars)
        )
    }
}

// Per-event data predicates; events whose query is exactly `$` need no
// data test and collapse into a single name check.
fn events_clause(events: &BTreeMap<String, JsonPathFilter>) -> String {
    let mut names_only = Vec::new();
    let mut terms = Vec::new();
    for (name, filter) in events {
        if filter.is_match_all() {
            names_only.push(name.as_str());
        } else {
            terms.push(format!(
                "(event = '{}' AND {})",
                escape_literal(name),
                path_clause("data", filter)
            ));
        }
    }
    match names_only.len() {
        0 => {}
        1 => terms.push(format!("event = '{}'", escape_literal(names_only[0]))),
        _ => {
            let elements: Vec<String> = names_only.iter().map(|n| array_element(n)).collect();
            terms.push(format!(
                "event = ANY('{}')",
                escape_literal(&format!("{{{}}}", elements.join(",")))
            ));
        }
    }
    group(terms)
}

fn group(terms: Vec<String>) -> String {
    if terms.len() == 1 {
        terms.into_iter().next().expect("one term")
    } else {
        format!("({})", terms.join(" OR "))
    }
}

fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

// JSON string literal (quoted, escaped) for use inside a jsonpath.
fn json_string(s: &str) -> String {
    serde_json::to_string(&Value::String(s.to_string())).expect("string serialize")
}

// Element of a Postgres text[] literal.
fn array_element(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
