//! Authentication middleware: the Control Surface receives an
//! already-authenticated principal from the boundary and is otherwise
//! responsibility-free for auth (spec §4.6). Simplified from the
//! teacher's JWT/permission scheme to a single shared bearer token.
//! Applied only to mutating routes — GETs and the WebSocket upgrade carry
//! no principal requirement (spec: "reject any mutating operation if the
//! principal is absent").

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::super::AppState;

/// Rejects any request lacking a valid `Authorization: Bearer <token>`
/// header matching the configured `agent_token`.
pub async fn require_auth(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.config.read().agent_token.clone() else {
        return unauthorized_response("no agent_token configured; all mutations are rejected");
    };

    let token = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(t) if constant_time_eq(t.as_bytes(), expected.as_bytes()) => next.run(request).await,
        _ => unauthorized_response("missing or invalid bearer token"),
    }
}

/// Compares two byte strings in time independent of where they first
/// differ, so a timing side-channel can't narrow down the token.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": true, "kind": "auth_required", "message": message, "retryable": false })),
    )
        .into_response()
}
