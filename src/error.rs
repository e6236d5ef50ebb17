//! Crate-wide error type. Handlers return explicit results rather than
//! throwing across the router boundary; this is the single place an
//! internal failure becomes an HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("body read timed out")]
    BodyTimeout,

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
            }
            AppError::RateLimited { retry_after_ms } => {
                let retry_after_secs = retry_after_ms.div_ceil(1000).max(1);
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
                resp.headers_mut().insert(
                    axum::http::header::RETRY_AFTER,
                    retry_after_secs.to_string().parse().unwrap(),
                );
                resp
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::PayloadTooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload too large").into_response()
            }
            AppError::BodyTimeout => {
                (StatusCode::REQUEST_TIMEOUT, "body read timed out").into_response()
            }
            AppError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            AppError::MethodNotAllowed => {
                let mut resp = (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response();
                resp.headers_mut()
                    .insert(axum::http::header::ALLOW, "POST".parse().unwrap());
                resp
            }
            AppError::Internal(err) => {
                tracing::error!(%err, "unhandled internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({ "ok": false, "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}
