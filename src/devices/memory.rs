//! In-process device registry loaded from YAML.
//!
//! ```yaml
//! devices:
//!   - id: hood-1
//!     type: action.devices.types.HOOD
//!     traits: [action.devices.traits.OnOff]
//!     name: Kitchen hood
//!     states: { online: true, on: false }
//!     local: true
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use super::{CommandOutcome, Device, DeviceRegistry, Execution, States};

const ON_OFF_TRAIT: &str = "action.devices.traits.OnOff";

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub traits: Vec<String>,
    pub name: String,
    #[serde(default)]
    pub states: States,
    #[serde(default)]
    pub attributes: States,
    /// Reachable by the local execution app.
    #[serde(default)]
    pub local: bool,
}

#[derive(Debug, Deserialize)]
struct DevicesFile {
    #[serde(default)]
    devices: Vec<DeviceSpec>,
}

/// A device whose commands write their params onto its tracked states.
pub struct SimpleDevice {
    spec: DeviceSpec,
    states: RwLock<States>,
}

impl SimpleDevice {
    pub fn new(mut spec: DeviceSpec) -> Self {
        let states = std::mem::take(&mut spec.states);
        Self {
            spec,
            states: RwLock::new(states),
        }
    }

    /// An OnOff device of any type, e.g. `action.devices.types.HOOD`.
    pub fn on_off(id: &str, name: &str, device_type: &str) -> Self {
        let mut states = States::new();
        states.insert("online".into(), Value::Bool(true));
        states.insert("on".into(), Value::Bool(false));
        Self::new(DeviceSpec {
            id: id.to_string(),
            device_type: device_type.to_string(),
            traits: vec![ON_OFF_TRAIT.to_string()],
            name: name.to_string(),
            states,
            attributes: States::new(),
            local: false,
        })
    }

    pub fn local(mut self, local: bool) -> Self {
        self.spec.local = local;
        self
    }

    pub fn is_local(&self) -> bool {
        self.spec.local
    }

    /// The SYNC record, without the id (the dispatcher adds it).
    pub fn sync_record(&self) -> Value {
        let mut record = json!({
            "type": self.spec.device_type,
            "traits": self.spec.traits,
            "name": { "name": self.spec.name },
            "willReportState": true,
            "attributes": self.spec.attributes,
        });
        if self.spec.local {
            record["otherDeviceIds"] = json!([{ "deviceId": self.spec.id }]);
        }
        record
    }

    pub async fn set_state(&self, key: &str, value: Value) {
        self.states.write().await.insert(key.to_string(), value);
    }
}

#[async_trait]
impl Device for SimpleDevice {
    fn id(&self) -> &str {
        &self.spec.id
    }

    async fn states(&self) -> States {
        self.states.read().await.clone()
    }

    async fn execute(&self, execution: &Execution) -> CommandOutcome {
        let states = self.states.read().await;
        let tracked: Vec<String> = execution
            .params
            .keys()
            .filter(|key| states.contains_key(*key))
            .cloned()
            .collect();

        if !execution.params.is_empty() && tracked.is_empty() {
            tracing::warn!(
                device_id = %self.spec.id,
                command = %execution.command,
                "command has no params this device tracks"
            );
            return CommandOutcome::error("functionNotSupported");
        }

        let mut execution_states = tracked;
        execution_states.push("online".to_string());
        CommandOutcome {
            execution_states: Some(execution_states),
            ..Default::default()
        }
    }

    async fn updated(&self, execution: &Execution, _outcome: &CommandOutcome, is_local: bool) {
        let mut states = self.states.write().await;
        for (key, value) in &execution.params {
            states.insert(key.clone(), value.clone());
        }
        tracing::debug!(
            device_id = %self.spec.id,
            command = %execution.command,
            is_local,
            "device states updated"
        );
    }
}

/// Registry over a fixed set of `SimpleDevice`s.
#[derive(Default)]
pub struct MemoryRegistry {
    devices: BTreeMap<String, Arc<SimpleDevice>>,
}

impl MemoryRegistry {
    pub fn new(devices: impl IntoIterator<Item = SimpleDevice>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|d| (d.spec.id.clone(), Arc::new(d)))
                .collect(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let file: DevicesFile = serde_yaml::from_str(yaml).context("invalid devices YAML")?;
        let mut registry = Self::default();
        for spec in file.devices {
            if registry.devices.contains_key(&spec.id) {
                anyhow::bail!("duplicate device id '{}'", spec.id);
            }
            registry
                .devices
                .insert(spec.id.clone(), Arc::new(SimpleDevice::new(spec)));
        }
        Ok(registry)
    }

    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let registry = Self::from_yaml_str(&yaml)?;
        tracing::info!(devices = registry.len(), path = %path.display(), "devices loaded");
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<Arc<SimpleDevice>> {
        self.devices.get(id).cloned()
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn properties(&self) -> anyhow::Result<Map<String, Value>> {
        Ok(self
            .devices
            .iter()
            .map(|(id, device)| (id.clone(), device.sync_record()))
            .collect())
    }

    async fn states(&self, ids: &[String]) -> anyhow::Result<Map<String, Value>> {
        let mut out = Map::new();
        for id in ids {
            let states = match self.devices.get(id) {
                Some(device) => Value::Object(Device::states(device.as_ref()).await),
                None => json!({ "online": false }),
            };
            out.insert(id.clone(), states);
        }
        Ok(out)
    }

    async fn device(&self, id: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .get(id)
            .map(|device| device.clone() as Arc<dyn Device>)
    }

    async fn reachable_devices(&self) -> anyhow::Result<Vec<Value>> {
        Ok(self
            .devices
            .values()
            .filter(|device| device.is_local())
            .map(|device| json!({ "verificationId": device.spec.id }))
            .collect())
    }
}
