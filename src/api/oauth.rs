//! OAuth2 authorization-code endpoints used for account linking.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    Form, Json,
};
use base64::Engine;
use serde::Deserialize;

use crate::auth::{google, redirect, LoginCredentials, TokenGrant};
use crate::config::AuthMode;
use crate::errors::AppError;
use crate::AppState;

const LOGIN_PAGE: &str = include_str!("login.html");

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
}

#[derive(Deserialize)]
pub struct AuthorizeForm {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_login(
    mode: &AuthMode,
    client_id: &str,
    redirect_uri: &str,
    state: Option<&str>,
    error: Option<&str>,
) -> Html<String> {
    let (head, fields) = match mode {
        AuthMode::Local { .. } => (
            String::new(),
            r#"<label for="username">Username</label>
    <input type="text" id="username" name="username" autocomplete="username" required>
    <label for="password">Password</label>
    <input type="password" id="password" name="password" autocomplete="current-password" required>
    <button type="submit">Link</button>"#
                .to_string(),
        ),
        AuthMode::GoogleSignIn {
            client_id: google_client_id,
            ..
        } => (
            r#"<script src="https://accounts.google.com/gsi/client" async defer></script>
  <script>
    function onSignIn(response) {
      document.getElementById('id_token').value = response.credential;
      document.getElementById('login').submit();
    }
  </script>"#
                .to_string(),
            format!(
                r#"<input type="hidden" id="id_token" name="id_token">
    <div id="g_id_onload" data-client_id="{}" data-callback="onSignIn"></div>
    <div class="g_id_signin" data-type="standard"></div>"#,
                escape_html(google_client_id)
            ),
        ),
    };

    Html(
        LOGIN_PAGE
            .replace("{{head}}", &head)
            .replace("{{error}}", &escape_html(error.unwrap_or_default()))
            .replace("{{client_id}}", &escape_html(client_id))
            .replace("{{redirect_uri}}", &escape_html(redirect_uri))
            .replace("{{state}}", &escape_html(state.unwrap_or_default()))
            .replace("{{fields}}", &fields),
    )
}

/// Client id (no secret) and redirect URI checks shared by both authorize handlers.
fn check_authorize_request(
    state: &AppState,
    client_id: &str,
    redirect_uri: &str,
) -> Result<(), AppError> {
    if !state.authority.is_client_valid(client_id, None) {
        return Err(AppError::InvalidClient);
    }
    if !redirect::is_valid_redirect_uri(
        redirect_uri,
        state.authority.project_id(),
        state.config.public_url.as_deref(),
    ) {
        return Err(AppError::MalformedRequest("invalid redirect_uri".into()));
    }
    Ok(())
}

/// GET {root}/oauth: the login page.
pub async fn authorize_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Html<String>, AppError> {
    if let Some(response_type) = query.response_type.as_deref() {
        if response_type != "code" {
            return Err(AppError::MalformedRequest(format!(
                "unsupported response_type {}",
                response_type
            )));
        }
    }
    check_authorize_request(&state, &query.client_id, &query.redirect_uri)?;

    Ok(render_login(
        state.authority.auth_mode(),
        &query.client_id,
        &query.redirect_uri,
        query.state.as_deref(),
        None,
    ))
}

/// POST {root}/oauth: check the login and redirect back with a code.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Form(form): Form<AuthorizeForm>,
) -> Result<Response, AppError> {
    check_authorize_request(&state, &form.client_id, &form.redirect_uri)?;

    let user = match login_user(&state, &form).await {
        Some(user) => user,
        None => {
            tracing::warn!(client_id = %form.client_id, "login failed");
            let page = render_login(
                state.authority.auth_mode(),
                &form.client_id,
                &form.redirect_uri,
                form.state.as_deref(),
                Some("Login failed, please try again."),
            );
            return Ok((StatusCode::UNAUTHORIZED, page).into_response());
        }
    };

    let code = state.authority.issue_auth_code(&user).await?;

    let mut location = url::Url::parse(&form.redirect_uri)
        .map_err(|e| AppError::MalformedRequest(format!("invalid redirect_uri: {}", e)))?;
    {
        let mut query = location.query_pairs_mut();
        query.append_pair("code", &code);
        if let Some(s) = form.state.as_deref() {
            query.append_pair("state", s);
        }
    }

    tracing::info!(user = %user, "login succeeded, redirecting with code");
    Ok((StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response())
}

/// The user the submitted credentials prove, if any.
async fn login_user(state: &AppState, form: &AuthorizeForm) -> Option<String> {
    match state.authority.auth_mode() {
        AuthMode::Local { .. } => {
            let username = form.username.as_deref()?;
            let password = form.password.as_deref()?;
            state
                .authority
                .is_authenticated(&LoginCredentials::Password { username, password })
                .then(|| username.to_string())
        }
        AuthMode::GoogleSignIn { client_id, .. } => {
            let id_token = form.id_token.as_deref()?;
            let claims = match google::verify_id_token(id_token, client_id, &state.jwks_uri).await {
                Ok(claims) => claims,
                Err(e) => {
                    tracing::warn!("Google ID token rejected: {:#}", e);
                    return None;
                }
            };
            if !claims.email_verified {
                tracing::warn!(sub = %claims.sub, "Google account email not verified");
                return None;
            }
            let email = claims.email?;
            let allowed = state
                .authority
                .is_authenticated(&LoginCredentials::VerifiedEmail(&email));
            allowed.then_some(email)
        }
    }
}

/// Client credentials from HTTP Basic, falling back to the form body.
fn client_credentials(
    headers: &HeaderMap,
    form: &TokenForm,
) -> Option<(String, Option<String>)> {
    if let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let creds = String::from_utf8(decoded).ok()?;
        let (id, secret) = creds.split_once(':')?;
        return Some((id.to_string(), Some(secret.to_string())));
    }

    let id = form.client_id.clone().filter(|id| !id.is_empty())?;
    Some((id, form.client_secret.clone().filter(|s| !s.is_empty())))
}

/// POST {root}/token
pub async fn token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(form): Form<TokenForm>,
) -> Result<Json<TokenGrant>, AppError> {
    let grant_type = form.grant_type.clone().unwrap_or_default();

    let result = grant(&state, &headers, &form, &grant_type).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(AppError::InvalidGrant) => "invalid_grant",
        Err(AppError::InvalidClient) => "invalid_client",
        Err(_) => "error",
    };
    let label = match grant_type.as_str() {
        "authorization_code" | "refresh_token" => grant_type.as_str(),
        _ => "other",
    };
    state.metrics.record_grant(label, outcome);
    result.map(Json)
}

async fn grant(
    state: &AppState,
    headers: &HeaderMap,
    form: &TokenForm,
    grant_type: &str,
) -> Result<TokenGrant, AppError> {
    // the token endpoint is for the confidential client only: a secret is required
    let (client_id, client_secret) =
        client_credentials(headers, form).ok_or(AppError::InvalidClient)?;
    let Some(client_secret) = client_secret else {
        tracing::warn!(client_id = %client_id, "token request without client secret");
        return Err(AppError::InvalidClient);
    };
    if !state
        .authority
        .is_client_valid(&client_id, Some(&client_secret))
    {
        return Err(AppError::InvalidClient);
    }

    match grant_type {
        "authorization_code" => {
            let code = form
                .code
                .as_deref()
                .ok_or_else(|| AppError::MalformedRequest("missing code".into()))?;
            let redirect_uri = form
                .redirect_uri
                .as_deref()
                .ok_or_else(|| AppError::MalformedRequest("missing redirect_uri".into()))?;
            let grant = state
                .authority
                .exchange_code(code, redirect_uri, state.config.public_url.as_deref())
                .await
                .map_err(|e| {
                    tracing::warn!(client_id = %client_id, "code exchange rejected: {}", e);
                    AppError::from(e)
                })?;
            Ok(grant)
        }
        "refresh_token" => {
            let refresh_token = form
                .refresh_token
                .as_deref()
                .ok_or_else(|| AppError::MalformedRequest("missing refresh_token".into()))?;
            Ok(state.authority.refresh(refresh_token).await?)
        }
        other => Err(AppError::UnsupportedGrantType(other.to_string())),
    }
}
