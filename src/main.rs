use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridge::auth::persist::FileBlobStore;
use bridge::devices::memory::MemoryRegistry;
use bridge::devices::DeviceRegistry;
use bridge::reporting::homegraph::{HomeGraphClient, ServiceAccountKey};
use bridge::reporting::{DisabledHomeGraph, HomeGraph};
use bridge::{api, cli, config, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // --help and --version never need a valid configuration
    let args = cli::Cli::parse();

    // OTLP export only when an endpoint is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "smarthome-bridge"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json_logs = std::env::var("SMARTHOME_LOG_JSON").is_ok_and(|v| v == "1");
    let (fmt_plain, fmt_json) = if json_logs {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "bridge=debug,smarthome_bridge=debug,tower_http=debug".into()),
        ))
        .with(fmt_plain)
        .with(fmt_json)
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Token { command }) => {
            handle_token_command(&admin_client(&cfg, args.url.as_deref())?, command).await
        }
        Some(cli::Commands::RequestSync) => {
            handle_request_sync(&admin_client(&cfg, args.url.as_deref())?).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// HomeGraph sink plus the project id it implies, if a key is configured.
async fn load_homegraph(
    cfg: &config::Config,
) -> anyhow::Result<(Arc<dyn HomeGraph>, Option<String>)> {
    match cfg.service_account_key_path() {
        Some(path) => {
            let key = ServiceAccountKey::from_file(&path).await?;
            let client = HomeGraphClient::new(key)?;
            let project_id = cfg
                .project_id
                .clone()
                .or_else(|| Some(client.project_id().to_string()));
            tracing::info!(project_id = ?project_id, "HomeGraph reporting enabled");
            Ok((Arc::new(client), project_id))
        }
        None => {
            tracing::warn!("no service account key configured, HomeGraph reporting disabled");
            Ok((Arc::new(DisabledHomeGraph), cfg.project_id.clone()))
        }
    }
}

async fn load_registry(cfg: &config::Config) -> anyhow::Result<Arc<dyn DeviceRegistry>> {
    let registry = match cfg.devices_file.as_deref() {
        Some(path) => MemoryRegistry::from_file(path).await?,
        None => MemoryRegistry::new(Vec::new()),
    };
    tracing::info!(devices = registry.len(), "device registry loaded");
    Ok(Arc::new(registry))
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let (homegraph, project_id) = load_homegraph(&cfg).await?;
    let registry = load_registry(&cfg).await?;
    let blob_store = Arc::new(FileBlobStore::new(cfg.auth_file()));
    tracing::info!(path = %blob_store.path().display(), "token store");

    let cleanup_period = Duration::from_secs(cfg.cleanup_interval_secs);
    let state = AppState::initialize(cfg, blob_store, registry, homegraph, project_id).await?;

    let app = api::router(state.clone())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                ]),
        )
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware));

    jobs::cleanup::spawn(state.authority.clone(), cleanup_period);
    tracing::info!(
        every_secs = cleanup_period.as_secs(),
        "background token cleanup started"
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("smarthome-bridge listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

/// Middleware: injects a unique X-Request-Id into every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: security headers on every response.
async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    // tokens travel in redirect URLs
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    headers.remove("server");

    resp
}

/// Admin commands act on the running server, which owns the token store.
fn admin_client(cfg: &config::Config, url: Option<&str>) -> anyhow::Result<cli::AdminClient> {
    let key = cfg
        .admin_key
        .as_ref()
        .context("SMARTHOME_ADMIN_KEY must be set for admin commands")?;
    let base = url
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", cfg.port));
    cli::AdminClient::new(&base, key)
}

async fn handle_token_command(
    client: &cli::AdminClient,
    cmd: cli::TokenCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Local => {
            let resp = client.get("/admin/tokens/local").await?;
            println!("{}", resp["code"].as_str().unwrap_or_default());
        }
        cli::TokenCommands::Status => {
            let status = client.get("/admin/tokens/status").await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        cli::TokenCommands::Revoke { user } => {
            let resp = client
                .post("/admin/tokens/revoke", &serde_json::json!({ "user": user }))
                .await?;
            println!("revoked {} token(s) for {}", resp["revoked"], user);
        }
    }
    Ok(())
}

async fn handle_request_sync(client: &cli::AdminClient) -> anyhow::Result<()> {
    let resp = client
        .post("/admin/request-sync", &serde_json::json!({}))
        .await?;
    if resp["linked"].as_bool().unwrap_or(false) {
        println!("sync requested");
    } else {
        println!("no linked account, nothing to sync");
    }
    Ok(())
}
