mod auth;
mod handlers;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use qproxy_core::AppState;

/// The JSON API surface. `/test` stays outside the service-key guard so
/// probes keep working without credentials.
pub fn api_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/chat", post(handlers::chat))
        .route("/embeddings", post(handlers::embeddings))
        .route("/audio", post(handlers::audio))
        .route("/image/ocr", post(handlers::image_ocr))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::service_key_guard,
        ));

    Router::new()
        .route("/test", get(handlers::health))
        .merge(protected)
        .with_state(state)
}
