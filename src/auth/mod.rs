//! Token authority: authorization codes, access/refresh tokens, the local
//! execution token pair, client and user validation.
//!
//! `Authority` is the only writer of its `TokenStore`. Every mutation runs
//! under one async mutex and is written through to the `BlobStore` before the
//! lock is released; a failed write is logged and the in-memory state stays
//! authoritative.

pub mod google;
pub mod persist;
pub mod redirect;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::{AuthMode, ClientCredentials};
use persist::BlobStore;
use store::{TokenGenerator, TokenStore};

/// Upper bound for the access token lifetime (one year).
pub const MAX_ACCESS_TOKEN_MINUTES: i64 = 525_600;

/// Identity reported for requests carrying a local execution token.
pub const LOCAL_EXECUTION_USER: &str = "local execution";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid grant: {0}")]
    InvalidGrant(&'static str),

    #[error("authorization code expired")]
    ExpiredGrant,

    #[error("redirect uri not allowed")]
    InvalidRedirect,

    #[error("client id or secret mismatch")]
    InvalidClient,

    #[error("could not generate a unique token")]
    TokenSpaceExhausted,
}

/// Who a bearer token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// One of the two local execution tokens.
    LocalExecution,
    User(String),
}

impl Identity {
    pub fn name(&self) -> &str {
        match self {
            Identity::LocalExecution => LOCAL_EXECUTION_USER,
            Identity::User(user) => user,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Identity::LocalExecution)
    }
}

/// Token endpoint response body.
#[derive(Debug, Clone, Serialize)]
pub struct TokenGrant {
    pub token_type: &'static str,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Proof of identity presented on the authorization page.
pub enum LoginCredentials<'a> {
    Password { username: &'a str, password: &'a str },
    /// Email taken from an already verified Google ID token.
    VerifiedEmail(&'a str),
}

#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub client: ClientCredentials,
    pub auth_mode: AuthMode,
    pub access_token_minutes: i64,
    pub project_id: Option<String>,
}

/// Time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Token counts for status output.
#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    pub access_tokens: usize,
    pub refresh_tokens: usize,
    pub pending_codes: usize,
    pub linked: bool,
}

pub struct Authority {
    config: AuthorityConfig,
    store: Mutex<TokenStore>,
    blob_store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

fn eq_ct(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// First and last four characters, for logs.
pub fn mask(token: &str) -> String {
    if token.len() > 12 && token.is_ascii() {
        format!("{}…{}", &token[..4], &token[token.len() - 4..])
    } else {
        "****".to_string()
    }
}

impl Authority {
    /// Load the persisted blob. An unusable blob is reset and written back.
    pub async fn load(config: AuthorityConfig, blob_store: Arc<dyn BlobStore>) -> Self {
        Self::load_with(
            config,
            blob_store,
            Arc::new(SystemClock),
            Box::new(store::random_token),
        )
        .await
    }

    pub async fn load_with(
        config: AuthorityConfig,
        blob_store: Arc<dyn BlobStore>,
        clock: Arc<dyn Clock>,
        generator: TokenGenerator,
    ) -> Self {
        let raw = match blob_store.load().await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("failed to load auth storage, starting empty: {:#}", e);
                None
            }
        };

        let (store, reset) = TokenStore::from_blob(raw.as_deref(), generator);
        if reset {
            tracing::info!("auth data not persisted or unreadable, created new token tables");
        } else {
            tracing::debug!(
                access_tokens = store.blob().access_tokens.len(),
                refresh_tokens = store.blob().refresh_tokens.len(),
                "auth data loaded"
            );
        }

        let mut config = config;
        if !(1..=MAX_ACCESS_TOKEN_MINUTES).contains(&config.access_token_minutes) {
            tracing::warn!(
                minutes = config.access_token_minutes,
                max = MAX_ACCESS_TOKEN_MINUTES,
                "access token lifetime out of range, clamped"
            );
            config.access_token_minutes = config
                .access_token_minutes
                .clamp(1, MAX_ACCESS_TOKEN_MINUTES);
        }

        let authority = Self {
            config,
            store: Mutex::new(store),
            blob_store,
            clock,
        };
        // a usable blob is left alone; only a fresh table set is written
        if reset {
            let store = authority.store.lock().await;
            authority.persist(&store).await;
        }
        authority
    }

    async fn persist(&self, store: &TokenStore) {
        let blob = match store.to_blob() {
            Ok(blob) => blob,
            Err(e) => {
                tracing::error!("failed to serialize auth data: {:#}", e);
                return;
            }
        };
        if let Err(e) = self.blob_store.save(&blob).await {
            tracing::error!("failed to write auth data: {:#}", e);
        }
    }

    pub fn access_token_minutes(&self) -> i64 {
        self.config.access_token_minutes
    }

    pub fn project_id(&self) -> Option<&str> {
        self.config.project_id.as_deref()
    }

    pub fn auth_mode(&self) -> &AuthMode {
        &self.config.auth_mode
    }

    fn expires_in(&self) -> i64 {
        60 * self.config.access_token_minutes
    }

    // ── Grants ───────────────────────────────────────────────

    /// Issue a single-use authorization code for `user`, valid ten minutes.
    pub async fn issue_auth_code(&self, user: &str) -> Result<String, AuthError> {
        let now = self.clock.now();
        let mut store = self.store.lock().await;
        let purged = store.purge_expired_codes(now);
        if purged > 0 {
            tracing::debug!(purged, "removed expired authorization codes");
        }
        let code = store.insert_code(user, now)?;
        tracing::info!(user, "issued authorization code");
        Ok(code)
    }

    /// Redeem an authorization code.
    ///
    /// On success the code is gone, every earlier token of the user is
    /// revoked, and a fresh refresh/access token pair is returned.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        own_uri: Option<&str>,
    ) -> Result<TokenGrant, AuthError> {
        let now = self.clock.now();
        let mut store = self.store.lock().await;

        let info = store
            .code(code)
            .cloned()
            .ok_or(AuthError::InvalidGrant("unknown authorization code"))?;

        if info.expires_at < now {
            tracing::warn!(
                user = %info.user,
                expired_at = %info.expires_at,
                "expired authorization code presented"
            );
            return Err(AuthError::ExpiredGrant);
        }

        if !redirect::is_valid_redirect_uri(redirect_uri, self.project_id(), own_uri) {
            return Err(AuthError::InvalidRedirect);
        }

        store.remove_code(code);
        store.remove_all_for_user(&info.user, now);

        let refresh_token = store.insert_refresh_token(&info.user)?;
        let access_token = store.insert_access_token(
            &info.user,
            now + Duration::minutes(self.config.access_token_minutes),
        )?;

        self.persist(&store).await;
        tracing::info!(user = %info.user, "authorization code exchanged");

        Ok(TokenGrant {
            token_type: "bearer",
            access_token,
            refresh_token: Some(refresh_token),
            expires_in: self.expires_in(),
        })
    }

    /// Mint a new access token from a refresh token. Earlier access tokens of
    /// the same user stop working.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let now = self.clock.now();
        let mut store = self.store.lock().await;

        let user = match store.refresh_token_user(refresh_token) {
            Some(user) => user.to_string(),
            None => {
                tracing::warn!(token = %mask(refresh_token), "refresh token not found");
                return Err(AuthError::InvalidGrant("unknown refresh token"));
            }
        };

        store.remove_access_tokens_for_user_or_expired(&user, now);
        let access_token = store.insert_access_token(
            &user,
            now + Duration::minutes(self.config.access_token_minutes),
        )?;

        self.persist(&store).await;
        tracing::debug!(user = %user, "access token refreshed");

        Ok(TokenGrant {
            token_type: "bearer",
            access_token,
            refresh_token: None,
            expires_in: self.expires_in(),
        })
    }

    // ── Validation ───────────────────────────────────────────

    /// Resolve a bearer token. Local tokens never expire by clock.
    pub async fn validate_access_token(&self, token: &str) -> Option<Identity> {
        let now = self.clock.now();
        let store = self.store.lock().await;
        Self::resolve(&store, token, now)
    }

    fn resolve(store: &TokenStore, token: &str, now: DateTime<Utc>) -> Option<Identity> {
        if store.is_local_token(token) {
            return Some(Identity::LocalExecution);
        }
        let info = match store.access_token(token) {
            Some(info) => info,
            None => {
                tracing::debug!(token = %mask(token), "access token not found");
                return None;
            }
        };
        if info.expires_at < now {
            tracing::debug!(
                user = %info.user,
                expired_at = %info.expires_at,
                "access token expired"
            );
            return None;
        }
        Some(Identity::User(info.user.clone()))
    }

    /// True for the current local token, or for `next`, which is promoted to
    /// current (and replaced) on first use.
    pub async fn validate_local_access_token(&self, token: &str) -> bool {
        let mut store = self.store.lock().await;
        self.check_local(&mut store, token).await
    }

    async fn check_local(&self, store: &mut TokenStore, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        if token == store.next_local_auth_code() {
            if let Err(e) = store.rotate_local_pair() {
                tracing::error!("local token rotation failed: {}", e);
                return false;
            }
            self.persist(store).await;
            tracing::info!("local execution token rotated");
            return true;
        }
        token == store.local_auth_code()
    }

    /// Rotation check and identity lookup under a single lock, so a
    /// concurrent rotation cannot invalidate the token in between.
    pub async fn authenticate(&self, token: &str) -> Option<Identity> {
        let now = self.clock.now();
        let mut store = self.store.lock().await;
        if self.check_local(&mut store, token).await {
            return Some(Identity::LocalExecution);
        }
        Self::resolve(&store, token, now)
    }

    // ── Revocation / maintenance ─────────────────────────────

    /// Remove every access and refresh token owned by `user`.
    pub async fn revoke_all_for_user(&self, user: &str) -> usize {
        let now = self.clock.now();
        let mut store = self.store.lock().await;
        let removed = store.remove_all_for_user(user, now);
        self.persist(&store).await;
        tracing::info!(user, removed, "revoked all tokens for user");
        removed
    }

    /// Drop expired codes and access tokens; persists only when something went.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.store.lock().await;
        let codes = store.purge_expired_codes(now);
        let tokens = store.remove_expired_access_tokens(now);
        if tokens > 0 {
            self.persist(&store).await;
        }
        codes + tokens
    }

    /// Whether any user has linked the account (a refresh token exists).
    pub async fn is_linked(&self) -> bool {
        self.store.lock().await.has_refresh_tokens()
    }

    /// The token handed to the local execution app: the pending `next`.
    pub async fn local_auth_code(&self) -> String {
        self.store.lock().await.next_local_auth_code().to_string()
    }

    pub async fn status(&self) -> AuthStatus {
        let store = self.store.lock().await;
        AuthStatus {
            access_tokens: store.blob().access_tokens.len(),
            refresh_tokens: store.blob().refresh_tokens.len(),
            pending_codes: store.code_count(),
            linked: store.has_refresh_tokens(),
        }
    }

    // ── Clients and users ────────────────────────────────────

    /// Exact client id match; the secret is compared only when supplied.
    pub fn is_client_valid(&self, client_id: &str, client_secret: Option<&str>) -> bool {
        if !eq_ct(client_id, &self.config.client.client_id) {
            tracing::warn!(client_id, "client id does not match");
            return false;
        }
        if let Some(secret) = client_secret {
            if !eq_ct(secret, &self.config.client.client_secret) {
                tracing::warn!(client_id, "client secret does not match");
                return false;
            }
        }
        true
    }

    pub fn is_authenticated(&self, credentials: &LoginCredentials<'_>) -> bool {
        match (&self.config.auth_mode, credentials) {
            (
                AuthMode::Local { username, password },
                LoginCredentials::Password {
                    username: given_user,
                    password: given_password,
                },
            ) => {
                let ok = eq_ct(given_user, username)
                    & eq_ct(given_password, password.as_str());
                if !ok {
                    tracing::debug!(username = %given_user, "username or password does not match");
                }
                ok
            }
            (AuthMode::GoogleSignIn { allowed_emails, .. }, LoginCredentials::VerifiedEmail(email)) => {
                let ok = allowed_emails.iter().any(|allowed| allowed == email);
                if !ok {
                    tracing::warn!(email, "email not in allow-list");
                }
                ok
            }
            _ => {
                tracing::warn!("login method does not match the configured auth mode");
                false
            }
        }
    }
}
