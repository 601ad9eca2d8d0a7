//! EXECUTE fan-out: one independent result per (command, device) pair.

use super::types::{CommandResult, ExecutePayload};
use super::Dispatcher;
use crate::devices::{is_online, Execution, States};

impl Dispatcher {
    /// Run every execution of every command group against each of its
    /// devices. Returns the results in request order and the ids whose state
    /// should be reported upstream.
    pub(crate) async fn execute_commands(
        &self,
        payload: &ExecutePayload,
        is_local: bool,
    ) -> (Vec<CommandResult>, Vec<String>) {
        let mut results = Vec::new();
        let mut to_report = Vec::new();

        for group in &payload.commands {
            for execution in &group.execution {
                for device in &group.devices {
                    let (result, report) = self.execute_one(execution, &device.id, is_local).await;
                    self.metrics.record_execute_result(&result.status);
                    if report && !to_report.contains(&device.id) {
                        to_report.push(device.id.clone());
                    }
                    results.push(result);
                }
            }
        }

        (results, to_report)
    }

    async fn execute_one(
        &self,
        execution: &Execution,
        device_id: &str,
        is_local: bool,
    ) -> (CommandResult, bool) {
        let Some(device) = self.registry.device(device_id).await else {
            tracing::warn!(device_id, command = %execution.command, "device not found");
            return (CommandResult::offline(device_id), false);
        };

        let current = device.states().await;
        if !is_online(&current) {
            tracing::warn!(device_id, command = %execution.command, "device is offline");
            return (CommandResult::offline(device_id), false);
        }

        let outcome = device.execute(execution).await;

        // handler answered directly
        if let Some(status) = &outcome.status {
            tracing::debug!(device_id, status = %status, error_code = ?outcome.error_code, "handler returned status");
            let source = if outcome.states.is_empty() {
                &current
            } else {
                &outcome.states
            };
            let mut states = States::new();
            overlay(&mut states, source, outcome.execution_states.as_deref());
            return (
                CommandResult {
                    ids: vec![device_id.to_string()],
                    status: status.clone(),
                    error_code: outcome.error_code.clone(),
                    states,
                    challenge_needed: outcome.challenge_needed.clone(),
                },
                false,
            );
        }

        // Full param set from the handler wins; otherwise only keys the
        // device already tracks are applied.
        let params: States = if outcome.params.is_empty() {
            execution
                .params
                .iter()
                .filter(|(key, _)| current.contains_key(*key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        } else {
            outcome.params.clone()
        };
        let applied = Execution {
            command: execution.command.clone(),
            params,
        };
        device.updated(&applied, &outcome, is_local).await;

        let source = if outcome.states.is_empty() {
            device.states().await
        } else {
            outcome.states.clone()
        };
        let mut states = applied.params;
        overlay(&mut states, &source, outcome.execution_states.as_deref());

        tracing::info!(device_id, command = %execution.command, is_local, "command executed");
        (
            CommandResult {
                ids: vec![device_id.to_string()],
                status: "SUCCESS".into(),
                error_code: None,
                states,
                challenge_needed: None,
            },
            outcome.report_state,
        )
    }
}

/// Copy the listed keys that `source` has into `target`.
fn overlay(target: &mut States, source: &States, keys: Option<&[String]>) {
    for key in keys.unwrap_or_default() {
        if let Some(value) = source.get(key) {
            target.insert(key.clone(), value.clone());
        }
    }
}
