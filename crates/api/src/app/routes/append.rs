//! Append endpoint.
//!
//! One POST serves both flavors: without an inner selector the append is
//! factual and the response selector covers the event's entities; with a
//! selector the append is atomic and a lost race answers 409 carrying the
//! selector advanced to the position that beat us.

use axum::extract::Extension;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use evently_auth::Action;
use evently_core::{codec, AppendEvent, FilterSelector, Ledger, Selector};
use evently_store::{AppendOutcome, AppendReceipt};

use crate::app::errors::ApiError;
use crate::app::hal;
use crate::app::routes::common::current_ledger;
use crate::app::services::AppState;
use crate::context::AuthContext;

pub fn router() -> Router {
    Router::new().route("/append", post(append))
}

#[derive(Deserialize)]
struct AppendRequest {
    #[serde(flatten)]
    event: AppendEvent,
    #[serde(default)]
    selector: Option<Selector>,
}

async fn append(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<AppendRequest>,
) -> Result<Response, ApiError> {
    ctx.require(Action::AppendEvents)?;
    let ledger = current_ledger(&state, &ctx).await?;

    let outcome = match &body.selector {
        None => state.store.append_factual(&ledger, &body.event).await,
        Some(selector) => {
            state
                .store
                .append_atomic(&ledger, &body.event, selector)
                .await
        }
    }
    .map_err(|err| substitute_remediation(ApiError::from(err), &ledger));

    match outcome? {
        AppendOutcome::Success(receipt) => {
            success_response(&body.event, body.selector.as_ref(), receipt)
        }
        AppendOutcome::Race { message } => {
            race_response(&state, &ledger, body.selector.as_ref(), message).await
        }
    }
}

// 201 with a Location that selects the appended event and everything
// after it.
fn success_response(
    event: &AppendEvent,
    selector: Option<&Selector>,
    receipt: AppendReceipt,
) -> Result<Response, ApiError> {
    let echo = match selector {
        Some(selector) => selector.clone(),
        None => Selector::Filter(FilterSelector {
            entities: event.entities.clone(),
            ..Default::default()
        }),
    };
    let advanced = echo.with_after(receipt.event_id);
    let token = codec::encode(&advanced)?;
    let href = hal::selector_href(&token);

    let body = hal::resource(
        [("self", href.clone()), ("events", href.clone())],
        json!({
            "eventId": receipt.event_id,
            "idempotencyKey": receipt.idempotency_key,
        }),
    );
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, header_value(&href)?)],
        Json(body),
    )
        .into_response())
}

// 409 pointing at the selector URI advanced past the event that won.
async fn race_response(
    state: &AppState,
    ledger: &Ledger,
    selector: Option<&Selector>,
    message: String,
) -> Result<Response, ApiError> {
    let selector = selector.cloned().unwrap_or(Selector::plain(None, None));
    let position = state.source.latest_event_id(ledger, &selector).await?;
    let current = codec::encode(&selector.with_after(position))?;
    Ok((
        StatusCode::CONFLICT,
        Json(json!({
            "message": message,
            "current": hal::selector_href(&current),
        })),
    )
        .into_response())
}

// Store-level messages carry `/REGISTER` and `/RESET` placeholders; the
// HTTP layer owns the real URIs.
fn substitute_remediation(mut err: ApiError, ledger: &Ledger) -> ApiError {
    err.message = err
        .message
        .replace("/REGISTER", "/registry/register-event")
        .replace("/RESET", &format!("/ledgers/{}/reset", ledger.id));
    err
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::bad_request("invalid header value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use evently_core::{EventId, LedgerId};

    #[test]
    fn append_request_takes_the_selector_alongside_event_fields() {
        let request: AppendRequest = serde_json::from_value(json!({
            "event": "order-placed",
            "entities": {"order": ["o-1"]},
            "idempotencyKey": "K",
            "selector": {"entities": {"order": ["o-1"]}}
        }))
        .unwrap();
        assert_eq!(request.event.event, "order-placed");
        assert_eq!(request.event.idempotency_key.as_deref(), Some("K"));
        assert!(request.selector.unwrap().is_filter());
    }

    #[test]
    fn remediation_placeholders_become_real_uris() {
        let ledger = Ledger {
            id: LedgerId::from_u32(0xff),
            name: "x".into(),
            description: String::new(),
            genesis: EventId::new(1, 1, LedgerId::from_u32(0xff)),
        };
        let err = substitute_remediation(
            ApiError::forbidden("register it at /REGISTER or reset at /RESET"),
            &ledger,
        );
        assert!(err.message.contains("/registry/register-event"));
        assert!(err.message.contains("/ledgers/000000ff/reset"));
    }

    #[test]
    fn factual_success_location_selects_the_event_entities() {
        let event: AppendEvent = serde_json::from_value(json!({
            "event": "order-placed",
            "entities": {"order": ["o-1"]}
        }))
        .unwrap();
        let receipt = AppendReceipt {
            event_id: EventId::new(9, 9, LedgerId::from_u32(1)),
            idempotency_key: "k".into(),
        };
        let response = success_response(&event, None, receipt).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("/selectors/"));
        assert!(location.ends_with(".ndjson"));

        // The Location decodes back to a selector positioned at the event.
        let token = location
            .strip_prefix("/selectors/")
            .and_then(|t| t.strip_suffix(".ndjson"))
            .unwrap();
        let decoded = codec::decode(token).unwrap();
        assert_eq!(decoded.after(), Some(EventId::new(9, 9, LedgerId::from_u32(1))));
        assert!(decoded.is_filter());
    }
}
