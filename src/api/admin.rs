//! Operator routes used by the CLI. The token store lives in the server's
//! memory, so token management goes through here instead of the blob file.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::auth::{mask, AuthStatus};
use crate::devices::States;
use crate::errors::AppError;
use crate::net::is_loopback_ip;
use crate::AppState;

/// Header carrying the admin key.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Middleware: loopback peers presenting the configured admin key only.
/// 404 when no key is configured, 403 for remote peers, 401 for a bad key.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.config.admin_key.as_ref() else {
        return Err(StatusCode::NOT_FOUND);
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    if !peer.map(is_loopback_ip).unwrap_or(false) {
        tracing::warn!(peer = ?peer, "admin API: refused non-loopback peer");
        return Err(StatusCode::FORBIDDEN);
    }

    let provided = req
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            req.headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim())
        });

    match provided {
        Some(k) if bool::from(k.as_bytes().ct_eq(expected.as_bytes())) => Ok(next.run(req).await),
        Some(k) => {
            // never log the expected key or the full provided one
            tracing::warn!("admin API: invalid key (provided: '{}')", mask(k));
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::warn!("admin API: missing X-Admin-Key header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// GET /admin/tokens/status
pub async fn token_status(State(state): State<Arc<AppState>>) -> Json<AuthStatus> {
    Json(state.authority.status().await)
}

/// GET /admin/tokens/local
pub async fn local_code(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "code": state.authority.local_auth_code().await }))
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub user: String,
}

/// POST /admin/tokens/revoke
pub async fn revoke(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<Value>, AppError> {
    if req.user.is_empty() {
        return Err(AppError::MalformedRequest("user must not be empty".into()));
    }
    let revoked = state.authority.revoke_all_for_user(&req.user).await;
    tracing::info!(user = %req.user, revoked, "tokens revoked by operator");
    Ok(Json(json!({ "user": req.user, "revoked": revoked })))
}

fn queued(accepted: bool, linked: bool) -> (StatusCode, Json<Value>) {
    let status = if accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "queued": accepted, "linked": linked })))
}

/// POST /admin/request-sync
pub async fn request_sync(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let linked = state.authority.is_linked().await;
    queued(state.reporter.request_sync(), linked)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportStateRequest {
    pub device_id: Option<String>,
    pub states: Option<States>,
    pub notifications: Option<Value>,
}

/// POST /admin/report-state: push states or notifications the registry does
/// not produce itself.
pub async fn report_state(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReportStateRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if req.states.is_none() && req.notifications.is_none() {
        return Err(AppError::MalformedRequest(
            "states or notifications required".into(),
        ));
    }
    let linked = state.authority.is_linked().await;
    let accepted =
        state
            .reporter
            .report_state(req.device_id.as_deref(), req.states, req.notifications);
    Ok(queued(accepted, linked))
}
