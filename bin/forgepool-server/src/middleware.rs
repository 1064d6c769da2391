//! Admin-route authentication.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Rejects the request with `401` unless `FORGEPOOL_ADMIN_TOKEN` is unset
/// (auth disabled) or matches the `Authorization: Bearer <token>` header.
pub async fn check_admin_auth(req: Request<Body>, next: Next) -> Response {
    let expected = std::env::var("FORGEPOOL_ADMIN_TOKEN").ok();
    if let Some(expected_token) = expected {
        let provided = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(token) if token == expected_token => {}
            _ => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(serde_json::json!({ "error": "unauthorized" })),
                )
                    .into_response();
            }
        }
    }
    next.run(req).await
}
