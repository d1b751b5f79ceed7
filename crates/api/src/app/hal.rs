//! HAL-JSON body helpers.
//!
//! Bodies are plain `serde_json` values: a `_links` object keyed by
//! relation, merged with the resource's own fields.

use serde_json::{json, Map, Value};

/// Build a `_links` object from `(rel, href)` pairs.
pub fn links<I, S>(pairs: I) -> Value
where
    I: IntoIterator<Item = (S, String)>,
    S: Into<String>,
{
    let mut map = Map::new();
    for (rel, href) in pairs {
        map.insert(rel.into(), json!({ "href": href }));
    }
    Value::Object(map)
}

/// A resource body: `_links` plus fields.
pub fn resource<I, S>(link_pairs: I, fields: Value) -> Value
where
    I: IntoIterator<Item = (S, String)>,
    S: Into<String>,
{
    let mut body = Map::new();
    body.insert("_links".to_string(), links(link_pairs));
    if let Value::Object(fields) = fields {
        body.extend(fields);
    }
    Value::Object(body)
}

/// Href of a selector fetch endpoint.
pub fn selector_href(token: &str) -> String {
    format!("/selectors/{token}.ndjson")
}

/// Href of a ledger download endpoint.
pub fn download_href(ledger: &str, token: &str) -> String {
    format!("/ledgers/{ledger}/download/{token}.ndjson")
}
