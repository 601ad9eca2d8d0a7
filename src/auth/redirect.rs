//! Redirect URI allow-list for the authorization-code grant.

use once_cell::sync::Lazy;
use regex::Regex;

const GOOGLE_REDIRECT: &str = "https://oauth-redirect.googleusercontent.com/r/";
const GOOGLE_SANDBOX_REDIRECT: &str = "https://oauth-redirect-sandbox.googleusercontent.com/r/";

static PORT: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+").expect("static regex"));

/// Strip the first `:<port>` so forwarded or proxied ports compare equal.
fn without_port(uri: &str) -> String {
    PORT.replacen(uri, 1, "").into_owned()
}

/// True when `redirect_uri` starts with `own_uri`, ports ignored, and the
/// match ends on a path, query or fragment boundary.
fn matches_own_origin(redirect_uri: &str, own_uri: &str) -> bool {
    let own = without_port(own_uri);
    let own = own.trim_end_matches('/');
    if own.is_empty() {
        return false;
    }
    let redirect = without_port(redirect_uri);
    match redirect.strip_prefix(own) {
        Some(rest) => rest.is_empty() || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}

/// Accepts the two Google callback hosts for `project_id`, or our own origin.
pub fn is_valid_redirect_uri(
    redirect_uri: &str,
    project_id: Option<&str>,
    own_uri: Option<&str>,
) -> bool {
    if let Some(own) = own_uri {
        if matches_own_origin(redirect_uri, own) {
            return true;
        }
    }

    let Some(project_id) = project_id.filter(|p| !p.is_empty()) else {
        tracing::warn!("redirect uri rejected: no project id configured");
        return false;
    };

    let valid = [GOOGLE_REDIRECT, GOOGLE_SANDBOX_REDIRECT]
        .iter()
        .any(|prefix| redirect_uri.strip_prefix(*prefix) == Some(project_id));
    if !valid {
        tracing::warn!(redirect_uri, "invalid redirect uri");
    }
    valid
}
