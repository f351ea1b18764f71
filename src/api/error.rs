use axum::{Json, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error};

use crate::models;

pub type ApiResult<T> = Result<ApiResponse<T>, ApiError>;

/// Fixed success envelope: `{success, data, timestamp}`.
pub struct ApiResponse<T>(pub T);

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> axum::response::Response {
        Json(json!({
            "success": true,
            "data": self.0,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response()
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authorization token missing")]
    AuthTokenMissing,
    #[error("authorization token invalid")]
    AuthTokenInvalid,
    #[error("{0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("domain limit reached")]
    DomainLimitReached,
    #[error("domain verification failed")]
    VerificationFailed(Value),
    #[error("too many requests, try again later")]
    RateLimited,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, Option<Value>) {
        match self {
            ApiError::AuthTokenMissing => (StatusCode::UNAUTHORIZED, "AUTH_TOKEN_MISSING", None),
            ApiError::AuthTokenInvalid => (StatusCode::UNAUTHORIZED, "AUTH_TOKEN_INVALID", None),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", None),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "RESOURCE_NOT_FOUND", None),
            ApiError::AccessDenied => (StatusCode::FORBIDDEN, "RESOURCE_ACCESS_DENIED", None),
            ApiError::Conflict("domain") => (StatusCode::CONFLICT, "DOMAIN_EXISTS", None),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "VALIDATION_ERROR", None),
            ApiError::DomainLimitReached => (StatusCode::CONFLICT, "DOMAIN_LIMIT_REACHED", None),
            ApiError::VerificationFailed(details) => (
                StatusCode::BAD_REQUEST,
                "VERIFICATION_FAILED",
                Some(details.clone()),
            ),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", None),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", None),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, ApiError::Internal) {
            error!("API server error: {self}");
        } else {
            debug!("API request failed: {self}");
        }

        let (status, code, details) = self.parts();

        let mut error = json!({ "code": code, "message": self.to_string() });
        if let Some(details) = details {
            error["details"] = details;
        }

        (
            status,
            Json(json!({
                "success": false,
                "error": error,
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response()
    }
}

impl From<models::Error> for ApiError {
    fn from(error: models::Error) -> Self {
        match error {
            models::Error::NotFound(_) => ApiError::NotFound,
            models::Error::Conflict => ApiError::Conflict("resource"),
            models::Error::AccessDenied => ApiError::AccessDenied,
            models::Error::BadRequest(message) => ApiError::Validation(message),
            models::Error::TooManyRequests => ApiError::RateLimited,
            models::Error::Quota(_) => ApiError::DomainLimitReached,
            error => {
                error!("database layer error: {error}");
                ApiError::Internal
            }
        }
    }
}

impl From<crate::storage::StorageError> for ApiError {
    fn from(error: crate::storage::StorageError) -> Self {
        error!("object store error: {error}");
        ApiError::Internal
    }
}

/// Maps garde report failures into the validation error shape.
impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    async fn body_json(error: ApiError) -> (StatusCode, Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn envelope_shape() {
        let (status, body) = body_json(ApiError::AuthTokenMissing).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "AUTH_TOKEN_MISSING");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn verification_failure_carries_details() {
        let details = json!({ "mx_record_found": true, "txt_record_found": false });
        let (status, body) = body_json(ApiError::VerificationFailed(details)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VERIFICATION_FAILED");
        assert_eq!(body["error"]["details"]["txt_record_found"], false);
    }

    #[tokio::test]
    async fn domain_conflict_uses_domain_code() {
        let (status, body) = body_json(ApiError::Conflict("domain")).await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "DOMAIN_EXISTS");
    }
}
