//! HTTP application wiring (axum router + middleware stack).
//!
//! - `services.rs`: infrastructure wiring (pool, components, feed)
//! - `routes/`: HTTP routes + handlers (one file per surface area)
//! - `errors.rs`: consistent error responses
//! - `hal.rs` / `ndjson.rs`: body framing helpers

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::auth_middleware;

pub mod errors;
pub mod hal;
pub mod ndjson;
pub mod routes;
pub mod services;

pub use services::{build_services, AppState};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    let protected = routes::router()
        .layer(Extension(state))
        .layer(axum::middleware::from_fn(auth_middleware));

    Router::new()
        .route("/", get(routes::system::index))
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(security_headers())
        .layer(cors())
        .layer(TraceLayer::new_for_http())
}

// Every response carries the same hardening headers. HSTS is left to the
// TLS terminator in front of the service.
fn security_headers() -> (
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
) {
    (
        SetResponseHeaderLayer::overriding(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("upgrade-insecure-requests; default-src https:"),
        ),
        SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
    )
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::HEAD, Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_LOCATION,
            header::HeaderName::from_static("last-event-id"),
            header::LINK,
            header::LOCATION,
            header::HeaderName::from_static("preference-applied"),
            header::HeaderName::from_static("profile"),
            header::WWW_AUTHENTICATE,
        ])
}
