use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;

/// smarthome-bridge: account linking and intent fulfillment for a local device runtime
#[derive(Parser)]
#[command(name = "smarthome-bridge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Base URL of the running bridge for the admin commands
    /// (defaults to http://127.0.0.1:$SMARTHOME_PORT)
    #[arg(long, global = true, env = "SMARTHOME_ADMIN_URL")]
    pub url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the bridge server
    Serve {
        /// Port to bind (defaults to SMARTHOME_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect and manage issued tokens on the running server
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Ask HomeGraph to re-SYNC the linked account
    RequestSync,
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Print the code to hand to the local execution app
    Local,
    /// Show token counts and whether an account is linked
    Status,
    /// Revoke every token issued to a user
    Revoke {
        #[arg(long)]
        user: String,
    },
}

/// Talks to the `/admin` routes of a running bridge.
pub struct AdminClient {
    http: reqwest::Client,
    base: String,
    key: String,
}

impl AdminClient {
    pub fn new(base: &str, key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            key: key.to_string(),
        })
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        self.send(self.http.get(format!("{}{}", self.base, path)))
            .await
    }

    pub async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        self.send(self.http.post(format!("{}{}", self.base, path)).json(body))
            .await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let resp = req
            .header("x-admin-key", &self.key)
            .send()
            .await
            .with_context(|| format!("is the bridge running at {}?", self.base))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("admin API returned {}: {}", status, body);
        }
        resp.json().await.context("admin API returned invalid JSON")
    }
}
