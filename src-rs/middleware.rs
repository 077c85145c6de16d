use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::state::AppState;

fn keys_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Guards intake routes with the shared `X-API-Key`. Without a configured
/// key every request is refused.
pub async fn api_key_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = match state.config.intake_api_key.as_deref() {
        Some(value) => value,
        None => {
            tracing::warn!("INTAKE_API_KEY is not set; refusing intake request");
            return (StatusCode::SERVICE_UNAVAILABLE, "Intake is not configured.").into_response();
        }
    };

    let presented = match request
        .headers()
        .get("X-API-Key")
        .and_then(|value| value.to_str().ok())
    {
        Some(value) if !value.trim().is_empty() => value.trim(),
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                "Unauthorized: API Key is required.",
            )
                .into_response()
        }
    };

    if !keys_match(presented, expected) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized: Invalid API Key.").into_response();
    }

    next.run(request).await
}
