use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use super::validate;
use super::AppState;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(validate::health))
        .route("/validate", axum::routing::post(validate::submit))
        // Fixed literal before the dynamic `/validate/{job_id}` for human
        // readability; axum's matchit router already prefers the literal
        // segment regardless of registration order (DESIGN.md Open
        // Question 1), and `active_route_not_shadowed` pins the behavior.
        .route("/validate/active", get(validate::list_active))
        .route("/validate/{job_id}", get(validate::get_status))
        .route("/validate/{job_id}/log", get(validate::get_log))
        .route("/task/{task_id}", get(validate::get_task))
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!(path = %req.uri(), "unhandled path");
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
