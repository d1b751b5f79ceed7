//! Root index and liveness.

use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::app::hal;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Root hypermedia index.
pub async fn index() -> impl IntoResponse {
    Json(hal::resource(
        [
            ("self", "/".to_string()),
            ("ledgers", "/ledgers".to_string()),
            ("registry", "/registry".to_string()),
            ("selectors", "/selectors".to_string()),
            ("append", "/append".to_string()),
            ("notifications", "/notify".to_string()),
        ],
        json!({}),
    ))
}
