//! Ledger administration and download endpoints.

use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use evently_auth::Action;
use evently_core::{codec, EventId, Ledger, LedgerId, Selector};

use crate::app::errors::ApiError;
use crate::app::hal;
use crate::app::routes::common::parse_select_param;
use crate::app::routes::selectors::{position_headers, stream_response, wants_representation};
use crate::app::services::AppState;
use crate::context::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/ledgers", get(index))
        .route("/ledgers/create-ledger", post(create))
        .route("/ledgers/:id", get(show).delete(remove))
        .route("/ledgers/:id/reset", post(reset))
        .route("/ledgers/:id/download", post(download_lookup))
        .route(
            "/ledgers/:id/download/:select",
            get(download).head(download_peek),
        )
}

/// GET /ledgers: hypermedia index.
///
/// There is no enumeration procedure; the index links the operations and
/// the ledger the token is scoped to, when it resolves.
async fn index(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let mut links = vec![
        ("self", "/ledgers".to_string()),
        ("create-ledger", "/ledgers/create-ledger".to_string()),
    ];
    let mut fields = json!({});
    if let Ok(id) = ctx.ledger_id() {
        if let Some(ledger) = state.ledgers.for_ledger_id(id).await? {
            links.push(("ledger", format!("/ledgers/{}", ledger.id)));
            fields = json!({ "ledger": ledger_fields(&ledger, None) });
        }
    }
    Ok(Json(hal::resource(links, fields)).into_response())
}

#[derive(Deserialize)]
struct CreateLedger {
    name: String,
    #[serde(default)]
    description: String,
}

/// POST /ledgers/create-ledger
async fn create(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<CreateLedger>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = state.ledgers.create(&body.name, &body.description).await?;
    let href = format!("/ledgers/{}", ledger.id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, header_value(&href)?)],
        Json(ledger_body(&ledger, None)),
    )
        .into_response())
}

/// GET /ledgers/:id
async fn show(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = path_ledger(&state, &id).await?;
    let count = state.ledgers.event_count(&ledger).await?;
    Ok(Json(ledger_body(&ledger, Some(count))).into_response())
}

/// DELETE /ledgers/:id
async fn remove(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = path_ledger(&state, &id).await?;
    state.ledgers.remove(&ledger).await?;
    state.registry.invalidate(ledger.id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize, Default)]
struct ResetLedger {
    #[serde(default)]
    after: Option<EventId>,
}

/// POST /ledgers/:id/reset: trim events after `after` (or to genesis).
async fn reset(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Option<Json<ResetLedger>>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = path_ledger(&state, &id).await?;
    let after = body.map(|Json(b)| b.after).unwrap_or(None);
    state.ledgers.reset(&ledger, after).await?;
    // Reset may have trimmed registration markers.
    state.registry.invalidate(ledger.id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// POST /ledgers/:id/download: lookup for a plain selector.
async fn download_lookup(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Selector>>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = path_ledger(&state, &id).await?;
    let selector = body
        .map(|Json(s)| s)
        .unwrap_or_else(|| Selector::plain(None, None));
    let selector = require_plain(selector)?;
    let token = codec::encode(&selector)?;
    let ledger_hex = ledger.id.to_string();
    let href = hal::download_href(&ledger_hex, &token);

    if wants_representation(&headers) {
        let link = move |token: &str| hal::download_href(&ledger_hex, token);
        let mut response = stream_response(&state, &ledger, &selector, &headers, link).await?;
        response
            .headers_mut()
            .insert(header::CONTENT_LOCATION, header_value(&href)?);
        return Ok(response);
    }
    Ok((StatusCode::SEE_OTHER, [(header::LOCATION, header_value(&href)?)]).into_response())
}

/// HEAD /ledgers/:id/download/:select.ndjson
async fn download_peek(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((id, select)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = path_ledger(&state, &id).await?;
    let selector = require_plain(parse_select_param(&select)?)?;
    let position = state.source.latest_event_id(&ledger, &selector).await?;
    let ledger_hex = ledger.id.to_string();
    let headers = position_headers(&selector, position, |token| {
        hal::download_href(&ledger_hex, token)
    })?;
    Ok((StatusCode::OK, headers).into_response())
}

/// GET /ledgers/:id/download/:select.ndjson
async fn download(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((id, select)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageLedgers)?;
    let ledger = path_ledger(&state, &id).await?;
    let selector = require_plain(parse_select_param(&select)?)?;
    let ledger_hex = ledger.id.to_string();
    stream_response(&state, &ledger, &selector, &headers, |token| {
        hal::download_href(&ledger_hex, token)
    })
    .await
}

async fn path_ledger(state: &AppState, id: &str) -> Result<Ledger, ApiError> {
    let id: LedgerId = id.parse().map_err(ApiError::from)?;
    state
        .ledgers
        .for_ledger_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("ledger"))
}

// Download is the plain-selector surface; filters belong to /selectors.
fn require_plain(selector: Selector) -> Result<Selector, ApiError> {
    if selector.is_filter() {
        return Err(ApiError::bad_request(
            "download accepts plain selectors only",
        ));
    }
    Ok(selector)
}

fn ledger_fields(ledger: &Ledger, event_count: Option<u64>) -> serde_json::Value {
    let mut fields = json!({
        "id": ledger.id,
        "name": ledger.name,
        "description": ledger.description,
        "genesis": ledger.genesis,
    });
    if let Some(count) = event_count {
        fields["eventCount"] = json!(count);
    }
    fields
}

fn ledger_body(ledger: &Ledger, event_count: Option<u64>) -> serde_json::Value {
    let base = format!("/ledgers/{}", ledger.id);
    hal::resource(
        [
            ("self", base.clone()),
            ("download", format!("{base}/download")),
            ("reset", format!("{base}/reset")),
        ],
        ledger_fields(ledger, event_count),
    )
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::bad_request("invalid header value"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_requirement_rejects_filters() {
        let filter: Selector =
            serde_json::from_value(json!({"entities": {"order": ["o-1"]}})).unwrap();
        assert!(require_plain(filter).is_err());
        assert!(require_plain(Selector::plain(None, Some(5))).is_ok());
    }

    #[test]
    fn ledger_body_links_admin_operations() {
        let ledger = Ledger {
            id: LedgerId::from_u32(0xff),
            name: "orders".into(),
            description: String::new(),
            genesis: EventId::new(1, 1, LedgerId::from_u32(0xff)),
        };
        let body = ledger_body(&ledger, Some(3));
        assert_eq!(body["_links"]["self"]["href"], "/ledgers/000000ff");
        assert_eq!(body["_links"]["reset"]["href"], "/ledgers/000000ff/reset");
        assert_eq!(body["eventCount"], 3);
        assert_eq!(body["id"], "000000ff");
    }
}
