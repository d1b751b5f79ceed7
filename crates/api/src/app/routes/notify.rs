//! Notification channels and SSE delivery.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Extension, Path};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use evently_auth::Action;
use evently_core::Selector;
use evently_notify::{ChannelId, SubscriptionId, SSE_EVENT, SSE_RETRY_MS};

use crate::app::errors::ApiError;
use crate::app::hal;
use crate::app::services::AppState;
use crate::context::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/notify", get(index))
        .route("/notify/open-channel", post(open_channel))
        .route("/notify/:channel", get(show_channel).delete(close_channel))
        .route("/notify/:channel/sse", get(event_stream))
        .route("/notify/:channel/subscribe", post(subscribe))
        .route(
            "/notify/:channel/subscriptions/:subscription",
            get(show_subscription).delete(unsubscribe),
        )
}

async fn index(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channels: Vec<String> = state
        .notify
        .channels(ledger)
        .into_iter()
        .map(|id| format!("/notify/{id}"))
        .collect();
    Ok(Json(hal::resource(
        [
            ("self", "/notify".to_string()),
            ("open-channel", "/notify/open-channel".to_string()),
        ],
        json!({ "channels": channels }),
    ))
    .into_response())
}

/// POST /notify/open-channel
async fn open_channel(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel = state.notify.open(ledger);
    let href = format!("/notify/{channel}");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, header_value(&href)?)],
        Json(channel_body(&state, ledger, channel)?),
    )
        .into_response())
}

/// GET /notify/:channel
async fn show_channel(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel: ChannelId = channel.parse()?;
    Ok(Json(channel_body(&state, ledger, channel)?).into_response())
}

/// DELETE /notify/:channel: close; attached streams terminate.
async fn close_channel(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(channel): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel: ChannelId = channel.parse()?;
    state.notify.close(ledger, channel)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize)]
struct Subscribe {
    selector: Selector,
}

/// POST /notify/:channel/subscribe: idempotent by canonical selector.
async fn subscribe(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(channel): Path<String>,
    Json(body): Json<Subscribe>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel: ChannelId = channel.parse()?;
    let subscription = state.notify.subscribe(ledger, channel, body.selector)?;
    let href = format!("/notify/{channel}/subscriptions/{subscription}");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, header_value(&href)?)],
        Json(hal::resource(
            [("self", href.clone())],
            json!({ "subscriptionId": subscription }),
        )),
    )
        .into_response())
}

/// GET /notify/:channel/subscriptions/:subscription
async fn show_subscription(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((channel, subscription)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel: ChannelId = channel.parse()?;
    let subscription = SubscriptionId::from(subscription);
    let info = state.notify.subscription(ledger, channel, &subscription)?;
    Ok(Json(hal::resource(
        [(
            "self",
            format!("/notify/{channel}/subscriptions/{subscription}"),
        )],
        json!({ "subscriptionId": info.id, "selector": info.selector }),
    ))
    .into_response())
}

/// DELETE /notify/:channel/subscriptions/:subscription
async fn unsubscribe(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((channel, subscription)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel: ChannelId = channel.parse()?;
    state
        .notify
        .unsubscribe(ledger, channel, &SubscriptionId::from(subscription))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /notify/:channel/sse
///
/// Emits one `Subscriptions Triggered` message per append that matches at
/// least one of the channel's subscriptions. Reconnects carrying
/// `Last-Event-Id` are rejected: there is no catch-up replay.
async fn event_stream(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(channel): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    ctx.require(Action::Notifications)?;
    let ledger = ctx.ledger_id()?;
    let channel: ChannelId = channel.parse()?;

    let last_event_id = headers
        .get(header::HeaderName::from_static("last-event-id"))
        .and_then(|v| v.to_str().ok());
    let messages = state
        .notify
        .open_event_stream(ledger, channel, last_event_id)?;

    let stream = messages.map(|message| {
        Ok::<SseEvent, Infallible>(
            SseEvent::default()
                .id(message.id)
                .event(SSE_EVENT)
                .data(message.data)
                .retry(Duration::from_millis(SSE_RETRY_MS)),
        )
    });
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

fn channel_body(
    state: &AppState,
    ledger: evently_core::LedgerId,
    channel: ChannelId,
) -> Result<serde_json::Value, ApiError> {
    let subscriptions = state.notify.subscriptions(ledger, channel)?;
    let bodies: Vec<_> = subscriptions
        .iter()
        .map(|info| {
            json!({
                "subscriptionId": info.id,
                "selector": info.selector,
                "_links": {
                    "self": { "href": format!("/notify/{channel}/subscriptions/{}", info.id) }
                },
            })
        })
        .collect();
    Ok(hal::resource(
        [
            ("self", format!("/notify/{channel}")),
            ("subscribe", format!("/notify/{channel}/subscribe")),
            ("events", format!("/notify/{channel}/sse")),
        ],
        json!({ "channelId": channel.to_string(), "subscriptions": bodies }),
    ))
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::bad_request("invalid header value"))
}
