//! Selector lookup and fetch endpoints.
//!
//! A selector token is both the URL and the concurrency position: HEAD
//! answers with the ETag of the position the selector currently reads
//! through, GET streams the matched events as NDJSON (or 304s when the
//! client's `If-None-Match` still holds), and POST turns a JSON selector
//! document into its canonical URI.

use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use evently_auth::Action;
use evently_core::{codec, Ledger, Selector};

use crate::app::errors::ApiError;
use crate::app::hal;
use crate::app::ndjson;
use crate::app::routes::common::{current_ledger, parse_select_param, position_etag};
use crate::app::services::AppState;
use crate::context::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/selectors", post(lookup))
        .route("/selectors/:select", get(fetch).head(peek))
}

/// POST /selectors: canonicalize a selector document.
///
/// Redirects to the canonical GET URI, or answers inline when the client
/// prefers a representation.
async fn lookup(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    Json(selector): Json<Selector>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ReplayEvents)?;
    let selector = selector.canonicalize()?;
    let token = codec::encode(&selector)?;
    let href = hal::selector_href(&token);

    if wants_representation(&headers) {
        let ledger = current_ledger(&state, &ctx).await?;
        let mut response =
            stream_response(&state, &ledger, &selector, &headers, hal::selector_href).await?;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_LOCATION, parse_header(&href)?);
        headers.insert(
            header::HeaderName::from_static("preference-applied"),
            HeaderValue::from_static("return=representation"),
        );
        return Ok(response);
    }

    Ok((
        StatusCode::SEE_OTHER,
        [(header::LOCATION, parse_header(&href)?)],
    )
        .into_response())
}

/// HEAD /selectors/:select.ndjson: position headers, empty body.
async fn peek(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(select): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ReplayEvents)?;
    let selector = parse_select_param(&select)?;
    let ledger = current_ledger(&state, &ctx).await?;

    let position = state.source.latest_event_id(&ledger, &selector).await?;
    let headers = position_headers(&selector, position, hal::selector_href)?;
    Ok((StatusCode::OK, headers).into_response())
}

/// GET /selectors/:select.ndjson: NDJSON stream of matched events.
async fn fetch(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(select): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ctx.require(Action::ReplayEvents)?;
    let selector = parse_select_param(&select)?;
    let ledger = current_ledger(&state, &ctx).await?;
    stream_response(&state, &ledger, &selector, &headers, hal::selector_href).await
}

/// Shared GET path: execute, compare ETags, stream or 304.
///
/// Also serves the ledger download endpoints, which differ only in how a
/// token maps to an href.
pub(super) async fn stream_response(
    state: &AppState,
    ledger: &Ledger,
    selector: &Selector,
    request_headers: &HeaderMap,
    href: impl Fn(&str) -> String,
) -> Result<Response, ApiError> {
    use evently_store::SelectorResult;

    let SelectorResult { position, events } = state.source.select(ledger.id, selector).await?;
    let headers = position_headers(selector, position, href)?;

    let etag = position_etag(position);
    let matched = request_headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|candidate| candidate.trim() == etag || candidate.trim() == "*");
    if matched {
        // The client already holds everything this selector reads
        // through; dropping the stream cancels the in-flight batch.
        drop(events);
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }

    let mut response = ndjson::response(events);
    response.headers_mut().extend(headers);
    Ok(response)
}

/// ETag, Cache-Control and Link relations for a selector position.
pub(super) fn position_headers(
    selector: &Selector,
    position: evently_core::EventId,
    href: impl Fn(&str) -> String,
) -> Result<HeaderMap, ApiError> {
    let start = codec::encode(selector)?;
    let current = codec::encode(&selector.with_after(position))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, parse_header(&position_etag(position))?);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private,max-age=0"),
    );
    let link = format!(
        "<{}>; rel=\"start\", <{}>; rel=\"current\"",
        href(&start),
        href(&current)
    );
    headers.insert(header::LINK, parse_header(&link)?);
    Ok(headers)
}

pub(super) fn wants_representation(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::HeaderName::from_static("prefer"))
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|p| p.trim() == "return=representation"))
}

fn parse_header(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::bad_request("value is not a valid header"))
}
