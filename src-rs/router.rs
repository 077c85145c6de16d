use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{handlers, middleware, state::AppState};

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;

    let api_router = Router::new()
        .route("/submissions", post(handlers::submit_document))
        .route("/jobs/{id}", get(handlers::get_job))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::api_key_auth,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_router)
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
