//! Google Sign-In ID token verification for the allow-list login mode.
//!
//! 1. Read the `kid` from the JWT header
//! 2. Look the key up in Google's JWKS (cached in-memory for an hour)
//! 3. Verify RS256 signature, expiry, audience (our Google client id) and issuer
//!
//! The caller then checks the verified email against the configured allow-list.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use once_cell::sync::Lazy;
use serde::Deserialize;

pub const GOOGLE_JWKS_URI: &str = "https://www.googleapis.com/oauth2/v3/certs";

const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

// ── Types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
}

/// Verified claims of a Google ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleClaims {
    pub sub: String,
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    pub exp: i64,
}

// ── JWKS Cache ───────────────────────────────────────────────

struct CachedJwks {
    jwks: Jwks,
    fetched_at: chrono::DateTime<Utc>,
}

static JWKS_CACHE: Lazy<DashMap<String, CachedJwks>> = Lazy::new(DashMap::new);

const JWKS_CACHE_TTL_SECS: i64 = 3600;

/// Fetch the key set, served from cache while fresh.
pub async fn get_jwks(jwks_uri: &str) -> anyhow::Result<Jwks> {
    if let Some(cached) = JWKS_CACHE.get(jwks_uri) {
        if Utc::now() - cached.fetched_at < Duration::seconds(JWKS_CACHE_TTL_SECS) {
            return Ok(cached.jwks.clone());
        }
    }

    tracing::info!(jwks_uri = %jwks_uri, "fetching JWKS keys");
    let resp = reqwest::get(jwks_uri).await?.error_for_status()?;
    let jwks: Jwks = resp.json().await?;

    JWKS_CACHE.insert(
        jwks_uri.to_string(),
        CachedJwks {
            jwks: jwks.clone(),
            fetched_at: Utc::now(),
        },
    );

    Ok(jwks)
}

// ── JWT Validation ───────────────────────────────────────────

/// Key id from the JWT header, without verifying anything.
pub fn extract_kid(token: &str) -> Option<String> {
    jsonwebtoken::decode_header(token).ok()?.kid
}

/// Verify a Google ID token issued for `client_id`.
pub async fn verify_id_token(
    id_token: &str,
    client_id: &str,
    jwks_uri: &str,
) -> anyhow::Result<GoogleClaims> {
    let kid = extract_kid(id_token).ok_or_else(|| anyhow::anyhow!("ID token has no key id"))?;
    let jwks = get_jwks(jwks_uri).await?;

    let jwk = jwks
        .keys
        .iter()
        .find(|k| k.kid.as_deref() == Some(kid.as_str()))
        .ok_or_else(|| anyhow::anyhow!("no JWKS key matches kid '{}'", kid))?;

    if jwk.kty != "RSA" {
        anyhow::bail!("unsupported key type '{}'", jwk.kty);
    }
    let (n, e) = match (&jwk.n, &jwk.e) {
        (Some(n), Some(e)) => (n, e),
        _ => anyhow::bail!("JWKS key '{}' lacks RSA components", kid),
    };
    let key = DecodingKey::from_rsa_components(n, e)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_audience(&[client_id]);
    validation.set_issuer(&GOOGLE_ISSUERS);

    let data = decode::<GoogleClaims>(id_token, &key, &validation)?;
    Ok(data.claims)
}
