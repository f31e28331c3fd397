use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use qproxy_core::AppState;

/// Service-to-service auth, enforced only when the server has a key
/// configured.
pub async fn service_key_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state
        .settings
        .service_api_key
        .as_deref()
        .filter(|key| !key.is_empty())
    {
        let provided = request
            .headers()
            .get("x-service-key")
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Unauthorized" })),
            )
                .into_response();
        }
    }
    next.run(request).await
}
