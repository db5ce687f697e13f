use axum::{http::StatusCode, response::IntoResponse, Json};

/// Liveness probe. Unauthenticated and exempt from rate limiting.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
