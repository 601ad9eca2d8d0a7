use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::net::is_local_ip;
use crate::AppState;

const CHECK_PAGE: &str = include_str!("check.html");

fn peer_ip(connect: Option<ConnectInfo<SocketAddr>>) -> Option<IpAddr> {
    connect.map(|ConnectInfo(addr)| addr.ip())
}

fn parse_body(body: &Bytes) -> Result<Value, AppError> {
    serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedRequest(format!("invalid JSON body: {}", e)))
}

/// Credentials first: an unauthenticated caller never gets the body parsed.
async fn fulfill(
    state: &AppState,
    peer: Option<IpAddr>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Json<Value>, AppError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(identity) = state.dispatcher.authenticate(authorization, peer).await? else {
        return Ok(Json(json!({})));
    };
    let body = parse_body(body)?;
    Ok(Json(state.dispatcher.dispatch(&identity, &body).await?))
}

/// POST {root}/smarthome
pub async fn cloud(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    fulfill(&state, peer_ip(connect), &headers, &body).await
}

/// POST {localRoot}/smarthome: same envelope, same-network callers only.
pub async fn local(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let peer = peer_ip(connect);
    if !peer.map(is_local_ip).unwrap_or(false) {
        tracing::warn!(peer = ?peer, "local route called from a non-local address");
        return Ok(Json(json!({})));
    }

    fulfill(&state, peer, &headers, &body).await
}

/// OPTIONS preflight; the allow-headers header is added by the router.
pub async fn preflight() -> impl IntoResponse {
    (StatusCode::OK, "null")
}

/// GET {root}/check
pub async fn check(State(state): State<Arc<AppState>>) -> Response {
    tracing::debug!("reachability check");
    if state.config.debug {
        (
            [(
                header::CONTENT_SECURITY_POLICY,
                "default-src 'self' 'unsafe-inline'",
            )],
            Html(CHECK_PAGE),
        )
            .into_response()
    } else {
        "SUCCESS".into_response()
    }
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
