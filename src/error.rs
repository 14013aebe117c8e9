use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Crate-wide error type. Variants map 1:1 onto the failure kinds the HTTP
/// surface can report; sandbox-internal failures (guest/host/timeout) are
/// captured as a `JobResult` and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("worker pool busy")]
    Busy,

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("timed out waiting for result")]
    AwaitTimeout,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serde error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Serde(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SandboxError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            SandboxError::Busy => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            SandboxError::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            SandboxError::AwaitTimeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            SandboxError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            SandboxError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            SandboxError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            SandboxError::Io(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            SandboxError::Serde(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if matches!(self, SandboxError::Busy) {
            response
                .headers_mut()
                .insert("Retry-After", "1".parse().unwrap());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn sandbox_error_is_send_sync() {
        assert_send_sync::<SandboxError>();
    }

    #[test]
    fn busy_maps_to_429() {
        let resp = SandboxError::Busy.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "1");
    }

    #[test]
    fn await_timeout_maps_to_504() {
        let resp = SandboxError::AwaitTimeout.into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn forbidden_maps_to_403() {
        let resp = SandboxError::Forbidden("escape".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
