use axum::Router;

pub mod append;
pub mod common;
pub mod ledgers;
pub mod notify;
pub mod registry;
pub mod selectors;
pub mod system;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .merge(ledgers::router())
        .merge(registry::router())
        .merge(selectors::router())
        .merge(append::router())
        .merge(notify::router())
}
