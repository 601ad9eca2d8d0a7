use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, StatusCode},
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod admin;
pub mod oauth;
pub mod smarthome;

/// Headers the assistant may send cross-origin.
pub const ALLOWED_HEADERS: &str = "Content-Type, Authorization";

/// `/{root}/{segment}` with exactly one slash between the parts.
pub fn join_path(root: &str, segment: &str) -> String {
    let root = root.trim_matches('/');
    if root.is_empty() {
        format!("/{}", segment)
    } else {
        format!("/{}/{}", root, segment)
    }
}

/// Build the full router: cloud routes under `http_root`, the local
/// execution route under `local_root`, `/metrics` and the `/admin` routes.
pub fn router(state: Arc<AppState>) -> Router {
    let root = state.config.http_root.clone();
    let local_root = state.config.local_root.clone();

    let smarthome = Router::new()
        .route(
            &join_path(&root, "smarthome"),
            post(smarthome::cloud).options(smarthome::preflight),
        )
        .route(
            &join_path(&local_root, "smarthome"),
            post(smarthome::local).options(smarthome::preflight),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(ALLOWED_HEADERS),
        ));

    let admin = Router::new()
        .route("/admin/tokens/status", get(admin::token_status))
        .route("/admin/tokens/local", get(admin::local_code))
        .route("/admin/tokens/revoke", post(admin::revoke))
        .route("/admin/request-sync", post(admin::request_sync))
        .route("/admin/report-state", post(admin::report_state))
        .layer(middleware::from_fn_with_state(state.clone(), admin::admin_auth));

    Router::new()
        .merge(smarthome)
        .merge(admin)
        .route(&join_path(&root, "check"), get(smarthome::check))
        .route(
            &join_path(&root, "oauth"),
            get(oauth::authorize_page).post(oauth::authorize),
        )
        .route(&join_path(&root, "token"), post(oauth::token))
        .route("/metrics", get(smarthome::metrics))
        .fallback(fallback_404)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}
