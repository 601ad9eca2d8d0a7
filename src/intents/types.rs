use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::devices::{Execution, States};

/// The fixed set of smart-home intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Sync,
    Query,
    Execute,
    Disconnect,
    Identify,
    ReachableDevices,
}

impl Intent {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "action.devices.SYNC" => Some(Self::Sync),
            "action.devices.QUERY" => Some(Self::Query),
            "action.devices.EXECUTE" => Some(Self::Execute),
            "action.devices.DISCONNECT" => Some(Self::Disconnect),
            "action.devices.IDENTIFY" => Some(Self::Identify),
            "action.devices.REACHABLE_DEVICES" => Some(Self::ReachableDevices),
            _ => None,
        }
    }

    /// Short name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Query => "QUERY",
            Self::Execute => "EXECUTE",
            Self::Disconnect => "DISCONNECT",
            Self::Identify => "IDENTIFY",
            Self::ReachableDevices => "REACHABLE_DEVICES",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRef {
    pub id: String,
    #[serde(default, rename = "customData")]
    pub custom_data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryPayload {
    pub devices: Vec<DeviceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandGroup {
    pub devices: Vec<DeviceRef>,
    pub execution: Vec<Execution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutePayload {
    pub commands: Vec<CommandGroup>,
}

/// One entry of the EXECUTE response, always for a single device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub ids: Vec<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub states: States,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_needed: Option<Value>,
}

impl CommandResult {
    pub fn offline(id: &str) -> Self {
        Self {
            ids: vec![id.to_string()],
            status: "ERROR".into(),
            error_code: Some("deviceOffline".into()),
            states: States::new(),
            challenge_needed: None,
        }
    }
}
