use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or malformed bearer credentials, or a token that does not validate.
    #[error("unauthenticated: {0}")]
    Unauthenticated(&'static str),

    #[error("invalid grant")]
    InvalidGrant,

    #[error("invalid client")]
    InvalidClient,

    #[error("unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The device registry could not produce devices or states.
    #[error("registry failure: {0}")]
    Registry(anyhow::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidGrant(_) | AuthError::ExpiredGrant | AuthError::InvalidRedirect => {
                AppError::InvalidGrant
            }
            AuthError::InvalidClient => AppError::InvalidClient,
            AuthError::TokenSpaceExhausted => AppError::Internal(err.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::Unauthenticated(reason) => {
                tracing::warn!(reason, "rejecting unauthenticated request");
                (StatusCode::UNAUTHORIZED, "missing inputs".to_string())
            }
            AppError::InvalidGrant => (StatusCode::BAD_REQUEST, "invalid_grant".to_string()),
            AppError::InvalidClient => (StatusCode::UNAUTHORIZED, "invalid_client".to_string()),
            AppError::UnsupportedGrantType(_) => (
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type".to_string(),
            ),
            AppError::MalformedRequest(reason) => {
                tracing::warn!(reason = %reason, "malformed request");
                (StatusCode::BAD_REQUEST, reason.clone())
            }
            AppError::Registry(e) => {
                tracing::error!("device registry failure: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "failed".to_string())
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_maps_to_401() {
        let resp = AppError::Unauthenticated("missing authorization header").into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "missing inputs");
    }

    #[tokio::test]
    async fn test_registry_failure_maps_to_500() {
        let resp = AppError::Registry(anyhow::anyhow!("no devices")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"], "failed");
    }

    #[test]
    fn test_auth_errors_collapse_to_invalid_grant() {
        assert!(matches!(
            AppError::from(AuthError::ExpiredGrant),
            AppError::InvalidGrant
        ));
        assert!(matches!(
            AppError::from(AuthError::InvalidRedirect),
            AppError::InvalidGrant
        ));
        assert!(matches!(
            AppError::from(AuthError::InvalidClient),
            AppError::InvalidClient
        ));
        assert!(matches!(
            AppError::from(AuthError::TokenSpaceExhausted),
            AppError::Internal(_)
        ));
    }
}
