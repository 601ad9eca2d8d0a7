//! Smart-home bridge: a small OAuth2 authority plus the intent endpoint the
//! cloud assistant (and its local execution app) talk to.

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod devices;
pub mod errors;
pub mod intents;
pub mod jobs;
pub mod metrics;
pub mod net;
pub mod reporting;

use std::sync::Arc;

use auth::persist::BlobStore;
use auth::{Authority, AuthorityConfig};
use devices::DeviceRegistry;
use reporting::{HomeGraph, ReportWorker, StateReporter};

/// The single agent user id the bridge reports to HomeGraph.
pub const AGENT_USER_ID: &str = "0";

/// Shared application state passed to handlers.
pub struct AppState {
    pub config: config::Config,
    pub authority: Arc<Authority>,
    pub dispatcher: intents::Dispatcher,
    pub reporter: StateReporter,
    pub metrics: Arc<metrics::Metrics>,
    /// Where Google Sign-In keys are fetched from.
    pub jwks_uri: String,
}

impl AppState {
    /// Load the token authority and start the state report worker.
    ///
    /// `project_id` is the resolved cloud project (configured or taken from
    /// the service account key).
    pub async fn initialize(
        config: config::Config,
        blob_store: Arc<dyn BlobStore>,
        registry: Arc<dyn DeviceRegistry>,
        homegraph: Arc<dyn HomeGraph>,
        project_id: Option<String>,
    ) -> anyhow::Result<Arc<Self>> {
        let metrics = Arc::new(metrics::Metrics::new()?);

        let authority = Arc::new(
            Authority::load(
                AuthorityConfig {
                    client: config.client.clone(),
                    auth_mode: config.auth_mode.clone(),
                    access_token_minutes: config.access_token_minutes,
                    project_id,
                },
                blob_store,
            )
            .await,
        );

        let worker = ReportWorker::new(homegraph, registry.clone(), authority.clone())
            .with_metrics(metrics.clone());
        let (reporter, _worker) = StateReporter::start(config.report_queue_capacity, worker);

        let dispatcher = intents::Dispatcher::new(
            authority.clone(),
            registry,
            reporter.clone(),
            metrics.clone(),
            config.node_id.clone(),
        );

        Ok(Arc::new(Self {
            config,
            authority,
            dispatcher,
            reporter,
            metrics,
            jwks_uri: auth::google::GOOGLE_JWKS_URI.to_string(),
        }))
    }
}
