//! Best-effort state reporting to Google HomeGraph.
//!
//! Handlers enqueue `ReportJob`s on a bounded channel and return at once; a
//! single worker task drains the queue, builds the HomeGraph payload and
//! calls the configured `HomeGraph` sink. Failures are logged and counted,
//! never surfaced to the request that caused them.

pub mod homegraph;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::auth::Authority;
use crate::devices::{DeviceRegistry, States};
use crate::metrics::Metrics;
use crate::AGENT_USER_ID;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("service account credentials rejected: {0}")]
    Credentials(String),

    #[error("HomeGraph transport error: {0}")]
    Transport(String),

    #[error("HomeGraph returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

/// Upstream sink for state reports and sync requests.
/// Implementations: HomeGraphClient (service account), DisabledHomeGraph (no key configured).
#[async_trait]
pub trait HomeGraph: Send + Sync {
    async fn report_state_and_notification(&self, body: &Value) -> Result<(), ReportError>;

    async fn request_sync(&self, agent_user_id: &str) -> Result<(), ReportError>;
}

/// Sink used when no service account key is configured.
pub struct DisabledHomeGraph;

#[async_trait]
impl HomeGraph for DisabledHomeGraph {
    async fn report_state_and_notification(&self, body: &Value) -> Result<(), ReportError> {
        tracing::debug!(body = %body, "HomeGraph disabled, state report dropped");
        Ok(())
    }

    async fn request_sync(&self, _agent_user_id: &str) -> Result<(), ReportError> {
        tracing::debug!("HomeGraph disabled, sync request dropped");
        Ok(())
    }
}

// ── Jobs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ReportJob {
    /// Re-read one device's states from the registry and report them.
    Device(String),
    /// Report the given states and/or notifications. Without a device id
    /// `states` is already keyed by device id.
    State {
        device_id: Option<String>,
        states: Option<States>,
        notifications: Option<Value>,
    },
    RequestSync,
}

impl ReportJob {
    fn kind(&self) -> &'static str {
        match self {
            ReportJob::Device(_) | ReportJob::State { .. } => "report_state",
            ReportJob::RequestSync => "request_sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No linked user; nothing to report to.
    Skipped,
}

/// Cloneable handle that enqueues report jobs without waiting.
#[derive(Clone)]
pub struct StateReporter {
    tx: mpsc::Sender<ReportJob>,
}

impl StateReporter {
    /// A handle plus the receiving end, for callers that drive the queue themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ReportJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Spawn the worker and return the handle feeding it.
    pub fn start(capacity: usize, worker: ReportWorker) -> (Self, JoinHandle<()>) {
        let (reporter, rx) = Self::channel(capacity);
        let handle = tokio::spawn(worker.run(rx));
        (reporter, handle)
    }

    fn enqueue(&self, job: ReportJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                tracing::warn!(kind = job.kind(), "report queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(job)) => {
                tracing::warn!(kind = job.kind(), "report worker stopped, dropping job");
                false
            }
        }
    }

    pub fn report_device(&self, device_id: &str) -> bool {
        self.enqueue(ReportJob::Device(device_id.to_string()))
    }

    pub fn report_state(
        &self,
        device_id: Option<&str>,
        states: Option<States>,
        notifications: Option<Value>,
    ) -> bool {
        self.enqueue(ReportJob::State {
            device_id: device_id.map(str::to_string),
            states,
            notifications,
        })
    }

    pub fn request_sync(&self) -> bool {
        self.enqueue(ReportJob::RequestSync)
    }
}

// ── Payload ──────────────────────────────────────────────────

fn new_request_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `reportStateAndNotification` request body.
pub fn build_report_body(
    device_id: Option<&str>,
    states: Option<States>,
    notifications: Option<Value>,
) -> Value {
    let mut devices = serde_json::Map::new();

    if let Some(mut states) = states {
        let states = match device_id {
            Some(id) => {
                states.remove("command");
                json!({ id: states })
            }
            None => Value::Object(states),
        };
        devices.insert("states".into(), states);
    }

    let mut body = json!({
        "requestId": new_request_id(),
        "agentUserId": AGENT_USER_ID,
    });

    if let Some(notifications) = notifications {
        match device_id {
            Some(id) => {
                body["eventId"] = Value::String(new_request_id());
                devices.insert("notifications".into(), json!({ id: notifications }));
            }
            None => tracing::warn!("notifications without a device id are not reported"),
        }
    }

    body["payload"] = json!({ "devices": devices });
    body
}

// ── Worker ───────────────────────────────────────────────────

pub struct ReportWorker {
    homegraph: Arc<dyn HomeGraph>,
    registry: Arc<dyn DeviceRegistry>,
    authority: Arc<Authority>,
    metrics: Option<Arc<Metrics>>,
}

impl ReportWorker {
    pub fn new(
        homegraph: Arc<dyn HomeGraph>,
        registry: Arc<dyn DeviceRegistry>,
        authority: Arc<Authority>,
    ) -> Self {
        Self {
            homegraph,
            registry,
            authority,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(self, mut rx: mpsc::Receiver<ReportJob>) {
        tracing::info!("state report worker started");
        while let Some(job) = rx.recv().await {
            let kind = job.kind();
            let outcome = match self.handle(job).await {
                Ok(Delivery::Sent) => "ok",
                Ok(Delivery::Skipped) => "skipped",
                Err(e) => {
                    tracing::error!(kind, "HomeGraph call failed: {}", e);
                    "error"
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_report(kind, outcome);
            }
        }
        tracing::info!("state report worker stopped");
    }

    /// Deliver one job now.
    pub async fn handle(&self, job: ReportJob) -> Result<Delivery, ReportError> {
        if !self.authority.is_linked().await {
            tracing::debug!(kind = job.kind(), "no linked user, skipping HomeGraph call");
            return Ok(Delivery::Skipped);
        }

        match job {
            ReportJob::RequestSync => {
                self.homegraph.request_sync(AGENT_USER_ID).await?;
                tracing::info!("HomeGraph sync requested");
            }
            ReportJob::Device(id) => {
                let states = match self.registry.states(std::slice::from_ref(&id)).await {
                    Ok(mut all) => match all.remove(&id) {
                        Some(Value::Object(states)) => states,
                        _ => {
                            tracing::warn!(device_id = %id, "no states to report");
                            return Ok(Delivery::Skipped);
                        }
                    },
                    Err(e) => {
                        tracing::warn!(device_id = %id, "could not read device states: {:#}", e);
                        return Ok(Delivery::Skipped);
                    }
                };
                let body = build_report_body(Some(&id), Some(states), None);
                self.homegraph.report_state_and_notification(&body).await?;
                tracing::debug!(device_id = %id, "device state reported");
            }
            ReportJob::State {
                device_id,
                states,
                notifications,
            } => {
                let body = build_report_body(device_id.as_deref(), states, notifications);
                self.homegraph.report_state_and_notification(&body).await?;
                tracing::debug!(device_id = ?device_id, "state reported");
            }
        }
        Ok(Delivery::Sent)
    }
}
