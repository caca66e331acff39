//! Thin bearer-token auth
//!
//! When an `auth-token` is configured, mutating routes require it; reads
//! stay anonymous.

use axum::http::{header, HeaderMap, StatusCode};
use serde::Serialize;

use super::state::ServerState;

/// Who a request is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Principal {
    Admin,
    Anonymous,
}

/// Resolve the caller's principal from the Authorization header.
pub fn principal(state: &ServerState, headers: &HeaderMap) -> Principal {
    let Some(expected) = &state.auth_token else {
        // No token configured: everything is admin
        return Principal::Admin;
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected => Principal::Admin,
        _ => Principal::Anonymous,
    }
}

/// Gate for mutating routes.
pub fn require_admin(state: &ServerState, headers: &HeaderMap) -> Result<(), StatusCode> {
    match principal(state, headers) {
        Principal::Admin => Ok(()),
        Principal::Anonymous => Err(StatusCode::UNAUTHORIZED),
    }
}
