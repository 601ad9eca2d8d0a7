pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Device state or parameter map, keyed by Google trait state names.
pub type States = Map<String, Value>;

/// One `execution` entry of an EXECUTE command group.
#[derive(Debug, Clone, Deserialize)]
pub struct Execution {
    pub command: String,
    #[serde(default)]
    pub params: States,
}

/// What a device handler reports back for one command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// When set the handler answered directly (challenge, refusal) and the
    /// response entry is built from this outcome verbatim.
    pub status: Option<String>,
    pub error_code: Option<String>,
    pub challenge_needed: Option<Value>,
    /// Full parameter set to apply instead of the command's own params.
    pub params: States,
    /// Replacement for the device's current states in the response.
    pub states: States,
    /// State keys copied into the response entry.
    pub execution_states: Option<Vec<String>>,
    pub report_state: bool,
}

impl Default for CommandOutcome {
    fn default() -> Self {
        Self {
            status: None,
            error_code: None,
            challenge_needed: None,
            params: States::new(),
            states: States::new(),
            execution_states: None,
            report_state: true,
        }
    }
}

impl CommandOutcome {
    pub fn error(code: &str) -> Self {
        Self {
            status: Some("ERROR".into()),
            error_code: Some(code.into()),
            ..Default::default()
        }
    }

    pub fn challenge(kind: Value) -> Self {
        Self {
            status: Some("ERROR".into()),
            error_code: Some("challengeNeeded".into()),
            challenge_needed: Some(kind),
            ..Default::default()
        }
    }
}

/// A controllable device owned by the registry.
#[async_trait]
pub trait Device: Send + Sync {
    fn id(&self) -> &str;

    /// Current tracked states, including `online`.
    async fn states(&self) -> States;

    /// Run one command. Must not mutate tracked states; `updated` does.
    async fn execute(&self, execution: &Execution) -> CommandOutcome;

    /// Called after a successful `execute` with the params actually applied.
    async fn updated(&self, execution: &Execution, outcome: &CommandOutcome, is_local: bool);
}

/// The component that owns device identity, state and command handling.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// SYNC records keyed by device id.
    async fn properties(&self) -> anyhow::Result<Map<String, Value>>;

    /// Current states keyed by device id.
    async fn states(&self, ids: &[String]) -> anyhow::Result<Map<String, Value>>;

    async fn device(&self, id: &str) -> Option<Arc<dyn Device>>;

    /// Devices the local execution app can verify on this network.
    async fn reachable_devices(&self) -> anyhow::Result<Vec<Value>>;
}

/// True when the state map carries `online: true`.
pub fn is_online(states: &States) -> bool {
    states.get("online").and_then(Value::as_bool).unwrap_or(false)
}
