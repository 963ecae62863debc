//! Management surface authorization.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::response::{code, err};
use crate::state::ApiState;

/// Bearer check for the management API. With no `USER_TOKEN` configured the
/// surface is open; requests from loopback always bypass the check.
pub async fn mgmt_auth(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.user_token.as_deref() else {
        return next.run(request).await;
    };
    if addr.ip().is_loopback() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => next.run(request).await,
        _ => err(code::UNAUTHORIZED, "unauthorized").into_response(),
    }
}
