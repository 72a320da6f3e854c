//! Shared-secret authentication for the internal admin surface.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use constant_time_eq::constant_time_eq;
use serde_json::json;

use crate::server::app::AppState;

pub const INTERNAL_TOKEN_HEADER: &str = "X-Worker-Internal-Token";

/// Compare the provided header token against the configured secret in
/// constant time. An unset server-side token rejects every request.
pub(crate) fn is_valid_internal_token(expected: Option<&str>, provided: Option<&str>) -> bool {
    match (expected, provided) {
        (Some(expected), Some(provided)) if !expected.is_empty() && !provided.is_empty() => {
            constant_time_eq(expected.as_bytes(), provided.as_bytes())
        }
        _ => false,
    }
}

pub async fn require_internal_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing_internal_token"})),
        )
            .into_response();
    };

    if !is_valid_internal_token(
        state.config.worker_internal_api_token.as_deref(),
        Some(provided),
    ) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid_internal_token"})),
        )
            .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_tokens_pass() {
        assert!(is_valid_internal_token(Some("secret-token"), Some("secret-token")));
    }

    #[test]
    fn mismatched_tokens_fail() {
        assert!(!is_valid_internal_token(Some("secret-token"), Some("wrong")));
    }

    #[test]
    fn missing_either_side_fails() {
        assert!(!is_valid_internal_token(None, Some("anything")));
        assert!(!is_valid_internal_token(Some("secret"), None));
        assert!(!is_valid_internal_token(Some(""), Some("")));
    }
}
