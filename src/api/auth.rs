use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::header::AUTHORIZATION;

use super::ApiState;

/// Checks `Authorization: Bearer <token>` when a token is configured;
/// without one the API is open.
pub async fn require_bearer(
	State(state): State<ApiState>,
	request: Request,
	next: Next,
) -> Response {
	let Some(expected) = &state.config.api.api_token else {
		return next.run(request).await;
	};
	let presented = request
		.headers()
		.get(AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));
	match presented {
		Some(token) if token == expected => next.run(request).await,
		_ => StatusCode::UNAUTHORIZED.into_response(),
	}
}
