//! Subprocess-backed `BuildEngine` driving the configured build tool CLI.
//!
//! Goals come from configuration; targets and metadata come from the tool's
//! own listing and introspection subcommands. Every invocation is a fresh
//! child process with captured stdio.

use crate::core::config::EngineConfig;
use crate::engine::{
    normalize_address, BuildEngine, EngineError, GoalDescriptor, GoalInvocation, GoalOutcome,
    TargetHandle, TargetMetadata,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct ProcessEngine {
    command: String,
    base_args: Vec<String>,
    root: Option<PathBuf>,
    list_targets_args: Vec<String>,
    metadata_args: Vec<String>,
    goals: Vec<GoalDescriptor>,
}

impl ProcessEngine {
    pub fn from_config(config: &EngineConfig) -> Self {
        ProcessEngine {
            command: config.command.clone(),
            base_args: config.args.clone(),
            root: config.root.clone(),
            list_targets_args: config.list_targets_args.clone(),
            metadata_args: config.metadata_args.clone(),
            goals: config
                .goals
                .iter()
                .map(|goal| GoalDescriptor {
                    name: goal.name.clone(),
                    description: goal.description.clone(),
                    param_schema: None,
                })
                .collect(),
        }
    }

    async fn run(
        &self,
        args: Vec<String>,
        cancel: Option<CancellationToken>,
    ) -> Result<GoalOutcome, EngineError> {
        let started = Utc::now();
        debug!(command = %self.command, args = ?args, "Running engine command");

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.base_args)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = &self.root {
            cmd.current_dir(root);
        }

        let child = cmd.spawn()?;
        let waited = child.wait_with_output();

        let output = match cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(command = %self.command, "Engine command cancelled");
                    return Err(EngineError::Cancelled);
                }
                result = waited => result?,
            },
            None => waited.await?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        debug!(
            command = %self.command,
            exit_code,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "Engine command finished"
        );

        Ok(GoalOutcome {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl BuildEngine for ProcessEngine {
    async fn list_goals(&self) -> Result<Vec<GoalDescriptor>, EngineError> {
        Ok(self.goals.clone())
    }

    async fn list_targets(&self) -> Result<Vec<TargetHandle>, EngineError> {
        let outcome = self.run(self.list_targets_args.clone(), None).await?;
        if !outcome.succeeded() {
            return Err(EngineError::Invalid(format!(
                "target listing exited with {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            )));
        }

        Ok(outcome
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| TargetHandle {
                address: normalize_address(line),
            })
            .collect())
    }

    async fn target_metadata(&self, address: &str) -> Result<TargetMetadata, EngineError> {
        let mut args = self.metadata_args.clone();
        args.push(address.to_string());

        let outcome = self.run(args, None).await?;
        if !outcome.succeeded() {
            return Err(EngineError::NotFound(format!(
                "target {address}: {}",
                outcome.stderr.trim()
            )));
        }

        let parsed: Value = serde_json::from_str(outcome.stdout.trim())
            .map_err(|err| EngineError::Invalid(format!("metadata for {address}: {err}")))?;
        metadata_from_value(address, parsed)
    }

    async fn invoke_goal(
        &self,
        invocation: GoalInvocation,
        cancel: CancellationToken,
    ) -> Result<GoalOutcome, EngineError> {
        if !self.goals.iter().any(|g| g.name == invocation.goal) {
            return Err(EngineError::NotFound(format!("goal {}", invocation.goal)));
        }

        let mut args = vec![invocation.goal.clone()];
        if let Some(address) = &invocation.target_address {
            args.push(address.clone());
        }
        args.extend(invocation.extra_args.iter().cloned());

        self.run(args, Some(cancel)).await
    }
}

/// Shape a tool-specific introspection document into [`TargetMetadata`].
///
/// Accepts either a single object or an array of objects (taking the entry
/// whose address matches, else the first). Well-known fields are lifted out;
/// everything else lands in sorted `attributes`.
fn metadata_from_value(address: &str, parsed: Value) -> Result<TargetMetadata, EngineError> {
    let normalized = normalize_address(address);

    let object = match parsed {
        Value::Object(map) => map,
        Value::Array(entries) => {
            let mut chosen = None;
            for entry in entries {
                if let Value::Object(map) = entry {
                    let matches = map
                        .get("address")
                        .and_then(Value::as_str)
                        .map(|a| normalize_address(a) == normalized)
                        .unwrap_or(false);
                    if matches {
                        chosen = Some(map);
                        break;
                    }
                    if chosen.is_none() {
                        chosen = Some(map);
                    }
                }
            }
            chosen.ok_or_else(|| {
                EngineError::Invalid(format!("metadata for {address}: empty document"))
            })?
        }
        other => {
            return Err(EngineError::Invalid(format!(
                "metadata for {address}: expected object, got {other}"
            )))
        }
    };

    let kind = ["target_type", "type", "kind", "alias"]
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .unwrap_or("target")
        .to_string();

    let string_list = |value: Option<&Value>| -> Vec<String> {
        value
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    };
    let dependencies = string_list(object.get("dependencies"));
    let sources = string_list(object.get("sources"));

    let mut attributes = BTreeMap::new();
    for (key, value) in object {
        match key.as_str() {
            "address" | "target_type" | "type" | "kind" | "alias" | "dependencies"
            | "sources" => {}
            _ => {
                attributes.insert(key, value);
            }
        }
    }

    Ok(TargetMetadata {
        address: normalized,
        kind,
        dependencies,
        sources,
        attributes,
    })
}
