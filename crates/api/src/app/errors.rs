//! Consistent error responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use evently_auth::ClaimsError;
use evently_core::DomainError;
use evently_notify::NotifyError;
use evently_store::StoreError;

/// An error ready to leave the service: a status and a one-sentence
/// message (plus `WWW-Authenticate` on 401s).
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "bearer token required")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (
            self.status,
            axum::Json(json!({ "message": self.message })),
        )
            .into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"evently\""),
            );
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Config(_) | StoreError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ReservedEntity(_) => Self::forbidden(err.to_string()),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<NotifyError> for ApiError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::ChannelNotFound => Self::not_found("channel"),
            NotifyError::SubscriptionNotFound => Self::not_found("subscription"),
            NotifyError::CatchUpUnsupported => Self::bad_request(err.to_string()),
            NotifyError::Selector(domain) => domain.into(),
        }
    }
}

impl From<ClaimsError> for ApiError {
    fn from(_: ClaimsError) -> Self {
        Self::unauthorized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_error_taxonomy() {
        assert_eq!(
            ApiError::from(StoreError::bad_request("x")).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::unprocessable("x")).status,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::from(StoreError::Unavailable).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("ledger")).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(NotifyError::CatchUpUnsupported).status,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = ApiError::from(StoreError::internal("op", "secret detail"));
        assert!(!err.message.contains("secret"));
        assert!(err.message.contains("ref#"));
    }
}
