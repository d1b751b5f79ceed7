//! Bearer authentication middleware.

use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use evently_auth::Claims;

use crate::app::errors::ApiError;
use crate::context::AuthContext;

pub async fn auth_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer(req.headers()) else {
        return ApiError::unauthorized().into_response();
    };
    let claims = match Claims::decode(token) {
        Ok(claims) => claims,
        Err(_) => return ApiError::unauthorized().into_response(),
    };
    req.extensions_mut().insert(AuthContext::new(claims));
    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_extraction_requires_the_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, "Basic Zm9v".parse().unwrap());
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, "Bearer  abc ".parse().unwrap());
        assert_eq!(extract_bearer(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert_eq!(extract_bearer(&headers), None);
    }
}
