use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::auth::MAX_ACCESS_TOKEN_MINUTES;

/// How end users prove who they are on the authorization page.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// A single local account.
    Local {
        username: String,
        password: Zeroizing<String>,
    },
    /// Google Sign-In ID tokens, restricted to an allow-list of emails.
    GoogleSignIn {
        client_id: String,
        allowed_emails: Vec<String>,
    },
}

/// The cloud service's OAuth client.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Zeroizing<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Prefix for the cloud-facing routes (`/smarthome`, `/check`, `/oauth`, `/token`).
    pub http_root: String,
    /// Prefix for the same-network execution route.
    pub local_root: String,
    pub node_id: String,
    pub data_dir: PathBuf,
    pub client: ClientCredentials,
    pub auth_mode: AuthMode,
    /// Access token lifetime in minutes.
    pub access_token_minutes: i64,
    pub service_account_key: Option<PathBuf>,
    /// Overrides the project id found in the service account key.
    pub project_id: Option<String>,
    /// Our own advertised origin, e.g. `https://home.example.com:3001`.
    pub public_url: Option<String>,
    pub devices_file: Option<PathBuf>,
    pub debug: bool,
    /// Enables the loopback-only `/admin` routes used by the CLI.
    pub admin_key: Option<Zeroizing<String>>,
    pub report_queue_capacity: usize,
    pub cleanup_interval_secs: u64,
}

impl Config {
    /// Location of the persisted token blob for this node.
    pub fn auth_file(&self) -> PathBuf {
        self.data_dir
            .join(format!("smarthome-auth-{}.json", self.node_id))
    }

    /// Service account key path, resolved against the data dir when relative.
    pub fn service_account_key_path(&self) -> Option<PathBuf> {
        self.service_account_key.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                self.data_dir.join(p)
            }
        })
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    load_from(|key| std::env::var(key).ok())
}

/// Build the configuration from an arbitrary variable lookup.
pub fn load_from<F>(lookup: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let client_id = var("SMARTHOME_CLIENT_ID")
        .ok_or_else(|| anyhow::anyhow!("SMARTHOME_CLIENT_ID must be set"))?;
    let client_secret = var("SMARTHOME_CLIENT_SECRET")
        .ok_or_else(|| anyhow::anyhow!("SMARTHOME_CLIENT_SECRET must be set"))?;

    let auth_mode = match var("SMARTHOME_GOOGLE_CLIENT_ID") {
        Some(google_client_id) => AuthMode::GoogleSignIn {
            client_id: google_client_id,
            allowed_emails: parse_email_list(&var("SMARTHOME_ALLOWED_EMAILS").unwrap_or_default()),
        },
        None => match (var("SMARTHOME_USERNAME"), lookup("SMARTHOME_PASSWORD")) {
            (Some(username), Some(password)) if !password.is_empty() => AuthMode::Local {
                username,
                password: Zeroizing::new(password),
            },
            _ => anyhow::bail!(
                "no login configured: set SMARTHOME_USERNAME and SMARTHOME_PASSWORD, \
                 or SMARTHOME_GOOGLE_CLIENT_ID and SMARTHOME_ALLOWED_EMAILS"
            ),
        },
    };

    let access_token_minutes = match var("SMARTHOME_ACCESS_TOKEN_MINUTES") {
        Some(raw) => match raw.parse::<i64>() {
            Ok(m) if (1..=MAX_ACCESS_TOKEN_MINUTES).contains(&m) => m,
            _ => anyhow::bail!(
                "SMARTHOME_ACCESS_TOKEN_MINUTES must be between 1 and {}",
                MAX_ACCESS_TOKEN_MINUTES
            ),
        },
        None => 60,
    };

    let http_root = var("SMARTHOME_HTTP_ROOT").unwrap_or_else(|| "/".into());
    let local_root = var("SMARTHOME_LOCAL_ROOT").unwrap_or_else(|| "/local".into());
    if http_root.trim_matches('/') == local_root.trim_matches('/') {
        anyhow::bail!("SMARTHOME_HTTP_ROOT and SMARTHOME_LOCAL_ROOT must differ");
    }

    Ok(Config {
        port: var("SMARTHOME_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(3001),
        http_root,
        local_root,
        node_id: var("SMARTHOME_NODE_ID").unwrap_or_else(|| "smarthome-bridge".into()),
        data_dir: var("SMARTHOME_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
        client: ClientCredentials {
            client_id,
            client_secret: Zeroizing::new(client_secret),
        },
        auth_mode,
        access_token_minutes,
        service_account_key: var("SMARTHOME_SERVICE_ACCOUNT_KEY").map(PathBuf::from),
        project_id: var("SMARTHOME_PROJECT_ID"),
        public_url: var("SMARTHOME_PUBLIC_URL"),
        devices_file: var("SMARTHOME_DEVICES_FILE").map(PathBuf::from),
        debug: var("SMARTHOME_DEBUG")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false),
        admin_key: var("SMARTHOME_ADMIN_KEY").map(Zeroizing::new),
        report_queue_capacity: var("SMARTHOME_REPORT_QUEUE")
            .and_then(|v| v.parse().ok())
            .filter(|c| *c > 0)
            .unwrap_or(256),
        cleanup_interval_secs: var("SMARTHOME_CLEANUP_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|s| *s > 0)
            .unwrap_or(300),
    })
}

/// Emails may be given as `a@x;b@y` or `a@x, b@y`.
fn parse_email_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
