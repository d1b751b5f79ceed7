//! Registry management endpoints (ledger-scoped via the bearer token).

use axum::extract::{Extension, Path};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use evently_auth::Action;

use crate::app::errors::ApiError;
use crate::app::hal;
use crate::app::routes::common::current_ledger;
use crate::app::services::AppState;
use crate::context::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/registry", get(index))
        .route("/registry/register-event", get(register_form).post(register))
        .route("/registry/events", get(list_events))
        .route(
            "/registry/events/:event",
            get(show_event).delete(unregister),
        )
        .route("/registry/entities", get(list_entities))
        .route("/registry/entities/:entity", get(show_entity))
}

async fn index(Extension(ctx): Extension<AuthContext>) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    Ok(Json(hal::resource(
        [
            ("self", "/registry".to_string()),
            ("events", "/registry/events".to_string()),
            ("entities", "/registry/entities".to_string()),
            ("register-event", "/registry/register-event".to_string()),
        ],
        json!({}),
    ))
    .into_response())
}

/// GET /registry/register-event: the registration form resource.
async fn register_form(Extension(ctx): Extension<AuthContext>) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    Ok(Json(hal::resource(
        [("self", "/registry/register-event".to_string())],
        json!({
            "method": "POST",
            "fields": { "event": "string", "entities": ["string"] },
        }),
    ))
    .into_response())
}

#[derive(Deserialize)]
struct RegisterEvent {
    event: String,
    #[serde(default)]
    entities: Vec<String>,
}

/// POST /registry/register-event
async fn register(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(body): Json<RegisterEvent>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    let ledger = current_ledger(&state, &ctx).await?;
    let registered = state
        .registry
        .register_event_type(&ledger, &body.event, &body.entities)
        .await?;
    let href = format!("/registry/events/{}", registered.event);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, header_value(&href)?)],
        Json(event_type_body(&registered)),
    )
        .into_response())
}

/// GET /registry/events
async fn list_events(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    let ledger = current_ledger(&state, &ctx).await?;
    let events = state.registry.all_events(&ledger).await?;
    let bodies: Vec<_> = events.iter().map(event_type_body).collect();
    Ok(Json(hal::resource(
        [("self", "/registry/events".to_string())],
        json!({ "events": bodies }),
    ))
    .into_response())
}

/// GET /registry/events/:event
async fn show_event(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(event): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    let ledger = current_ledger(&state, &ctx).await?;
    let registered = state.registry.get_event(&ledger, &event).await?;
    Ok(Json(event_type_body(&registered)).into_response())
}

/// DELETE /registry/events/:event
async fn unregister(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(event): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    let ledger = current_ledger(&state, &ctx).await?;
    state.registry.delete_event(&ledger, &event).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /registry/entities
async fn list_entities(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    let ledger = current_ledger(&state, &ctx).await?;
    let entities = state.registry.entities(&ledger).await?;
    Ok(Json(hal::resource(
        [("self", "/registry/entities".to_string())],
        json!({ "entities": entities }),
    ))
    .into_response())
}

/// GET /registry/entities/:entity: events that may reference the entity.
async fn show_entity(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(entity): Path<String>,
) -> Result<Response, ApiError> {
    ctx.require(Action::ManageRegistry)?;
    let ledger = current_ledger(&state, &ctx).await?;
    let events = state.registry.events_for_entity(&ledger, &entity).await?;
    let bodies: Vec<_> = events.iter().map(event_type_body).collect();
    Ok(Json(hal::resource(
        [("self", format!("/registry/entities/{entity}"))],
        json!({ "entity": entity, "events": bodies }),
    ))
    .into_response())
}

fn event_type_body(event_type: &evently_store::EventType) -> serde_json::Value {
    hal::resource(
        [("self", format!("/registry/events/{}", event_type.event))],
        json!({
            "event": event_type.event,
            "entities": event_type.entities,
        }),
    )
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::bad_request("invalid header value"))
}
