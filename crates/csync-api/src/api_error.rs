//! HTTP error mapping.
//!
//! Wraps `csync_core::error::SyncError` and implements Axum's `IntoResponse`,
//! translating each variant onto the status/body spec.md §6/§7 describes
//! (429 + `Retry-After` for rate limits, 401 + `auth_url` for directory auth,
//! etc).

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use csync_core::error::SyncError;
use serde_json::json;

/// The Google re-auth entry point a 401 response points callers at. Starting
/// that flow is an out-of-scope external collaborator (spec §1); this crate
/// only ever emits the hint.
const AUTH_URL: &str = "/auth/google/start";

pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            SyncError::InvalidInput(msg) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": msg }))).into_response()
            }
            SyncError::Unauthorised => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "Google auth required", "auth_url": AUTH_URL })),
            )
                .into_response(),
            SyncError::AuthMissing => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "source CRM credentials missing" })),
            )
                .into_response(),
            SyncError::RateLimited { retry_after_seconds } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "status": "rate_limited",
                        "rate_limit": {
                            "retry_after_seconds": retry_after_seconds,
                            "reason": "google_quota",
                        },
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    response.headers_mut().insert("Retry-After", value);
                }
                response
            }
            SyncError::Recoverable { reason } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "detail": format!("sync failed after retries: {reason}") })),
            )
                .into_response(),
            SyncError::Transport { status, body } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "detail": format!("upstream error {status}: {body}") })),
            )
                .into_response(),
            SyncError::Storage(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("storage error: {msg}") })),
            )
                .into_response(),
        }
    }
}
