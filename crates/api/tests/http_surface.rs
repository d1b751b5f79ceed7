//! Black-box tests for the HTTP surface.
//!
//! The router is exercised with `tower::ServiceExt::oneshot` against a
//! lazily-connected pool, covering everything that resolves before a
//! database round-trip: auth, RBAC, token decoding, channel lifecycle and
//! the hardening headers. Paths that need live data are integration
//! territory.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use evently_api::app::{build_app, AppState};
use evently_auth::{Claims, Role};
use evently_notify::NotifyCenter;
use evently_store::{EventStore, Ledgers, PgEventSource, Registry};

fn test_state() -> AppState {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/unused")
        .expect("lazy pool");
    let source = Arc::new(PgEventSource::new(pool.clone()));
    let registry = Arc::new(Registry::new(Arc::clone(&source), pool.clone()));
    AppState {
        ledgers: Arc::new(Ledgers::new(Arc::clone(&source), pool.clone())),
        store: Arc::new(EventStore::new(pool, Arc::clone(&registry))),
        registry,
        source,
        notify: Arc::new(NotifyCenter::new()),
    }
}

fn bearer(ledger: Option<&str>, roles: Vec<Role>) -> String {
    let claims = Claims {
        ledger: ledger.map(str::to_string),
        roles,
    };
    format!("Bearer {}", claims.encode())
}

fn request(method: Method, uri: &str) -> axum::http::request::Builder {
    Request::builder().method(method).uri(uri)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn root_index_is_public_hypermedia() {
    let app = build_app(test_state());
    let response = app
        .oneshot(request(Method::GET, "/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["_links"]["ledgers"]["href"], "/ledgers");
    assert_eq!(body["_links"]["notifications"]["href"], "/notify");
}

#[tokio::test]
async fn health_answers_without_auth() {
    let app = build_app(test_state());
    let response = app
        .oneshot(request(Method::GET, "/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_token_is_challenged() {
    let app = build_app(test_state());
    let response = app
        .oneshot(request(Method::GET, "/registry").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        "Bearer realm=\"evently\""
    );
}

#[tokio::test]
async fn garbage_tokens_are_unauthorized() {
    let app = build_app(test_state());
    let response = app
        .oneshot(
            request(Method::GET, "/registry")
                .header(header::AUTHORIZATION, "Bearer not-a-token!!")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn roles_gate_each_surface() {
    let app = build_app(test_state());

    // A reader cannot manage the registry.
    let response = app
        .clone()
        .oneshot(
            request(Method::GET, "/registry")
                .header(
                    header::AUTHORIZATION,
                    bearer(Some("00000001"), vec![Role::Reader]),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // A registrar cannot open notification channels.
    let response = app
        .oneshot(
            request(Method::POST, "/notify/open-channel")
                .header(
                    header::AUTHORIZATION,
                    bearer(Some("00000001"), vec![Role::Registrar]),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn security_headers_are_on_every_response() {
    let app = build_app(test_state());
    for uri in ["/", "/registry"] {
        let response = app
            .clone()
            .oneshot(request(Method::GET, uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_SECURITY_POLICY],
            "upgrade-insecure-requests; default-src https:"
        );
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    }
}

#[tokio::test]
async fn malformed_selector_tokens_are_bad_requests() {
    let app = build_app(test_state());
    let response = app
        .oneshot(
            request(Method::GET, "/selectors/!!!.ndjson")
                .header(
                    header::AUTHORIZATION,
                    bearer(Some("00000001"), vec![Role::Reader]),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("invalid URI part"));
}

#[tokio::test]
async fn selector_lookup_redirects_to_the_canonical_uri() {
    let app = build_app(test_state());
    let response = app
        .oneshot(
            request(Method::POST, "/selectors")
                .header(
                    header::AUTHORIZATION,
                    bearer(Some("00000001"), vec![Role::Client]),
                )
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"entities": {"order": ["o-1"]}}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("/selectors/"));
    assert!(location.ends_with(".ndjson"));
}

#[tokio::test]
async fn channel_lifecycle_and_idempotent_subscribe() {
    let app = build_app(test_state());
    let auth = bearer(Some("00000001"), vec![Role::Client]);

    // Open a channel.
    let response = app
        .clone()
        .oneshot(
            request(Method::POST, "/notify/open-channel")
                .header(header::AUTHORIZATION, auth.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let channel_href = response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_string();

    // Subscribing the same selector twice yields the same id.
    let subscribe = |selector: serde_json::Value| {
        let app = app.clone();
        let auth = auth.clone();
        let uri = format!("{channel_href}/subscribe");
        async move {
            let response = app
                .oneshot(
                    request(Method::POST, &uri)
                        .header(header::AUTHORIZATION, auth)
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(
                            serde_json::json!({ "selector": selector }).to_string(),
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            body_json(response).await["subscriptionId"]
                .as_str()
                .unwrap()
                .to_string()
        }
    };
    let first = subscribe(serde_json::json!({"entities": {"order": ["o-1"]}})).await;
    let second =
        subscribe(serde_json::json!({"entities": {"order": ["o-1"]}, "limit": 7})).await;
    assert_eq!(first, second);

    // SSE reconnect with Last-Event-Id is rejected.
    let response = app
        .clone()
        .oneshot(
            request(Method::GET, &format!("{channel_href}/sse"))
                .header(header::AUTHORIZATION, auth.clone())
                .header("Last-Event-Id", "0001")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Close the channel; it is gone afterwards.
    let response = app
        .clone()
        .oneshot(
            request(Method::DELETE, &channel_href)
                .header(header::AUTHORIZATION, auth.clone())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            request(Method::GET, &channel_href)
                .header(header::AUTHORIZATION, auth)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_channels_are_not_found() {
    let app = build_app(test_state());
    let response = app
        .oneshot(
            request(Method::GET, "/notify/00000000000000000000000000000000")
                .header(
                    header::AUTHORIZATION,
                    bearer(Some("00000001"), vec![Role::Client]),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
