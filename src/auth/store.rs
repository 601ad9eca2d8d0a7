//! In-memory token tables and their persisted blob form.
//!
//! `TokenStore` enforces the table invariants (uniqueness, single-use codes,
//! the local token pair) but performs no I/O; `Authority` decides when the
//! blob is written.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::AuthError;

/// Random bytes per generated code or token (256 bits).
const TOKEN_BYTES: usize = 32;

/// Regeneration attempts before a collision streak is treated as a fault.
pub(crate) const MAX_GENERATION_ATTEMPTS: usize = 8;

/// Lifetime of an authorization code.
pub const AUTH_CODE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub user: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenInfo {
    pub user: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// Persisted layout, one blob per node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBlob {
    #[serde(default)]
    pub access_tokens: HashMap<String, AccessTokenInfo>,
    #[serde(default)]
    pub refresh_tokens: HashMap<String, String>,
    #[serde(default)]
    pub local_auth_code: String,
    #[serde(default)]
    pub next_local_auth_code: String,
}

/// Source of fresh random token strings.
pub type TokenGenerator = Box<dyn FnMut() -> String + Send + Sync>;

/// Hex-encoded 256-bit value from the OS CSPRNG.
pub fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct TokenStore {
    blob: TokenBlob,
    auth_codes: HashMap<String, AuthorizationCode>,
    generator: TokenGenerator,
}

impl TokenStore {
    /// Empty tables with a freshly minted local token pair.
    pub fn new() -> Self {
        Self::with_generator(Box::new(random_token))
    }

    pub fn with_generator(generator: TokenGenerator) -> Self {
        let mut store = Self {
            blob: TokenBlob::default(),
            auth_codes: HashMap::new(),
            generator,
        };
        store.bootstrap_local_pair();
        store
    }

    /// Restore from a persisted blob.
    ///
    /// Returns the store and whether the blob had to be reset (missing, empty,
    /// corrupt or not a JSON object).
    pub fn from_blob(raw: Option<&[u8]>, generator: TokenGenerator) -> (Self, bool) {
        let mut store = Self {
            blob: TokenBlob::default(),
            auth_codes: HashMap::new(),
            generator,
        };

        let parsed = raw
            .filter(|bytes| !bytes.iter().all(u8::is_ascii_whitespace))
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).ok())
            .filter(serde_json::Value::is_object)
            .and_then(|value| serde_json::from_value::<TokenBlob>(value).ok());

        let reset = parsed.is_none();
        if let Some(blob) = parsed {
            store.blob = blob;
        }
        store.bootstrap_local_pair();
        (store, reset)
    }

    pub fn to_blob(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.blob)?)
    }

    pub fn blob(&self) -> &TokenBlob {
        &self.blob
    }

    /// Ensure both halves of the local token pair exist.
    fn bootstrap_local_pair(&mut self) {
        if self.blob.local_auth_code.is_empty() {
            if let Ok(token) = self.unique_access_token() {
                self.blob.local_auth_code = token;
            }
        }
        if self.blob.next_local_auth_code.is_empty() {
            if let Ok(token) = self.unique_access_token() {
                self.blob.next_local_auth_code = token;
            }
        }
    }

    // ── Generation ───────────────────────────────────────────

    fn generate_unique<F>(&mut self, taken: F) -> Result<String, AuthError>
    where
        F: Fn(&Self, &str) -> bool,
    {
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let candidate = (self.generator)();
            if !candidate.is_empty() && !taken(self, &candidate) {
                return Ok(candidate);
            }
        }
        tracing::error!(
            attempts = MAX_GENERATION_ATTEMPTS,
            "token generator kept producing collisions"
        );
        Err(AuthError::TokenSpaceExhausted)
    }

    /// A token that collides with no access token and neither local token.
    fn unique_access_token(&mut self) -> Result<String, AuthError> {
        self.generate_unique(|s, t| {
            s.blob.access_tokens.contains_key(t)
                || s.blob.local_auth_code == t
                || s.blob.next_local_auth_code == t
        })
    }

    // ── Authorization codes ──────────────────────────────────

    pub fn purge_expired_codes(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.auth_codes.len();
        self.auth_codes.retain(|_, info| info.expires_at >= now);
        before - self.auth_codes.len()
    }

    pub fn insert_code(&mut self, user: &str, now: DateTime<Utc>) -> Result<String, AuthError> {
        let code = self.generate_unique(|s, c| s.auth_codes.contains_key(c))?;
        self.auth_codes.insert(
            code.clone(),
            AuthorizationCode {
                user: user.to_string(),
                expires_at: now + Duration::minutes(AUTH_CODE_TTL_MINUTES),
            },
        );
        Ok(code)
    }

    pub fn code(&self, code: &str) -> Option<&AuthorizationCode> {
        self.auth_codes.get(code)
    }

    pub fn remove_code(&mut self, code: &str) -> Option<AuthorizationCode> {
        self.auth_codes.remove(code)
    }

    pub fn code_count(&self) -> usize {
        self.auth_codes.len()
    }

    // ── Access / refresh tokens ──────────────────────────────

    pub fn insert_access_token(
        &mut self,
        user: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let token = self.unique_access_token()?;
        self.blob.access_tokens.insert(
            token.clone(),
            AccessTokenInfo {
                user: user.to_string(),
                expires_at,
            },
        );
        Ok(token)
    }

    pub fn insert_refresh_token(&mut self, user: &str) -> Result<String, AuthError> {
        let token = self.generate_unique(|s, t| s.blob.refresh_tokens.contains_key(t))?;
        self.blob.refresh_tokens.insert(token.clone(), user.to_string());
        Ok(token)
    }

    pub fn access_token(&self, token: &str) -> Option<&AccessTokenInfo> {
        self.blob.access_tokens.get(token)
    }

    pub fn refresh_token_user(&self, token: &str) -> Option<&str> {
        self.blob.refresh_tokens.get(token).map(String::as_str)
    }

    /// Drop every access token that belongs to `user` or has expired.
    pub fn remove_access_tokens_for_user_or_expired(
        &mut self,
        user: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let before = self.blob.access_tokens.len();
        self.blob
            .access_tokens
            .retain(|_, info| info.user != user && info.expires_at >= now);
        before - self.blob.access_tokens.len()
    }

    pub fn remove_expired_access_tokens(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.blob.access_tokens.len();
        self.blob.access_tokens.retain(|_, info| info.expires_at >= now);
        before - self.blob.access_tokens.len()
    }

    /// Revoke every access and refresh token of `user` (expired access tokens
    /// of other users go too).
    pub fn remove_all_for_user(&mut self, user: &str, now: DateTime<Utc>) -> usize {
        let removed = self.remove_access_tokens_for_user_or_expired(user, now);
        let before = self.blob.refresh_tokens.len();
        self.blob.refresh_tokens.retain(|_, owner| owner != user);
        removed + (before - self.blob.refresh_tokens.len())
    }

    pub fn has_refresh_tokens(&self) -> bool {
        !self.blob.refresh_tokens.is_empty()
    }

    // ── Local execution pair ─────────────────────────────────

    pub fn is_local_token(&self, token: &str) -> bool {
        !token.is_empty()
            && (token == self.blob.local_auth_code || token == self.blob.next_local_auth_code)
    }

    pub fn local_auth_code(&self) -> &str {
        &self.blob.local_auth_code
    }

    pub fn next_local_auth_code(&self) -> &str {
        &self.blob.next_local_auth_code
    }

    /// Promote `next` to `current` and mint a new `next`.
    pub fn rotate_local_pair(&mut self) -> Result<(), AuthError> {
        let fresh = self.unique_access_token()?;
        self.blob.local_auth_code = std::mem::replace(&mut self.blob.next_local_auth_code, fresh);
        Ok(())
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}
