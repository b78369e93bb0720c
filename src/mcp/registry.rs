//! Capability snapshot: goals as tools, targets as resources.
//!
//! Built from one engine enumeration pass. Listings are sorted so two
//! identical enumerations produce identical listings, and every descriptor
//! keeps its compiled argument validator next to it.

use crate::engine::{normalize_address, BuildEngine, EngineError, GoalDescriptor};
use crate::mcp::{TARGET_MIME_TYPE, TARGET_URI_SCHEME};
use jsonschema::Validator;
use rust_mcp_schema::{Resource, Tool, ToolInputSchema};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug)]
pub struct RegisteredTool {
    /// Engine-side goal name (`test`), as opposed to the wire name
    /// (`goal-test`).
    pub goal: String,
    pub descriptor: Tool,
    validator: Validator,
}

impl RegisteredTool {
    /// Check call arguments against the tool's schema. The message names the
    /// offending property or path.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<(), String> {
        self.validator.validate(arguments).map_err(|err| {
            let path = err.instance_path().to_string();
            if path.is_empty() {
                err.to_string()
            } else {
                format!("{err} (at {path})")
            }
        })
    }
}

#[derive(Debug)]
pub struct RegisteredResource {
    pub address: String,
    pub descriptor: Resource,
}

#[derive(Debug)]
pub struct CapabilityRegistry {
    tools: Vec<RegisteredTool>,
    resources: Vec<RegisteredResource>,
}

impl CapabilityRegistry {
    /// Enumerate the engine once and freeze the result.
    pub async fn build(
        engine: &dyn BuildEngine,
        tool_prefix: &str,
    ) -> Result<Self, EngineError> {
        let mut tools = Vec::new();
        for goal in engine.list_goals().await? {
            tools.push(registered_tool(&goal, tool_prefix)?);
        }
        tools.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        for pair in tools.windows(2) {
            if pair[0].descriptor.name == pair[1].descriptor.name {
                return Err(EngineError::Invalid(format!(
                    "duplicate tool name {}",
                    pair[0].descriptor.name
                )));
            }
        }

        let mut addresses: Vec<String> = engine
            .list_targets()
            .await?
            .into_iter()
            .map(|target| normalize_address(&target.address))
            .collect();
        addresses.sort();
        addresses.dedup();

        let mut resources = Vec::new();
        for address in addresses {
            resources.push(registered_resource(&address)?);
        }

        debug!(
            tools = tools.len(),
            resources = resources.len(),
            "Built capability registry"
        );
        Ok(CapabilityRegistry { tools, resources })
    }

    pub fn tools(&self) -> &[RegisteredTool] {
        &self.tools
    }

    pub fn resources(&self) -> &[RegisteredResource] {
        &self.resources
    }

    pub fn wire_tools(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.descriptor.clone()).collect()
    }

    pub fn wire_resources(&self) -> Vec<Resource> {
        self.resources
            .iter()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn resolve_tool(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.descriptor.name == name)
    }

    pub fn resolve_resource(&self, uri: &str) -> Option<&RegisteredResource> {
        self.resources.iter().find(|r| r.descriptor.uri == uri)
    }
}

/// Arguments accepted by goals that declare no schema of their own.
pub fn default_goal_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "target_address": {
                "type": "string",
                "description": "Address of the target to run the goal against"
            },
            "extra_args": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Additional arguments passed through to the goal"
            }
        },
        "required": ["target_address"],
        "additionalProperties": false
    })
}

pub fn target_uri(address: &str) -> String {
    let normalized = normalize_address(address);
    format!("{TARGET_URI_SCHEME}{}", normalized.trim_start_matches('/'))
}

/// Invert [`target_uri`]; `None` when the scheme is wrong or the address
/// part is empty.
pub fn parse_target_uri(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix(TARGET_URI_SCHEME)?;
    if rest.is_empty() {
        return None;
    }
    Some(normalize_address(rest))
}

fn registered_tool(goal: &GoalDescriptor, tool_prefix: &str) -> Result<RegisteredTool, EngineError> {
    let schema = goal
        .param_schema
        .clone()
        .unwrap_or_else(default_goal_schema);

    let validator = jsonschema::validator_for(&schema).map_err(|err| {
        EngineError::Invalid(format!("schema for goal {}: {err}", goal.name))
    })?;

    // The wire descriptor models only type/properties/required; validation
    // keywords like additionalProperties stay with the compiled validator.
    let mut wire_schema = json!({"type": "object"});
    if let (Some(wire), Some(full)) = (wire_schema.as_object_mut(), schema.as_object()) {
        for key in ["properties", "required"] {
            if let Some(value) = full.get(key) {
                wire.insert(key.to_string(), value.clone());
            }
        }
    }
    let input_schema: ToolInputSchema = serde_json::from_value(wire_schema).map_err(|err| {
        EngineError::Invalid(format!("schema for goal {}: {err}", goal.name))
    })?;

    let name = format!("{tool_prefix}{}", goal.name);
    let description = goal
        .description
        .clone()
        .unwrap_or_else(|| format!("Run the {} goal", goal.name));

    Ok(RegisteredTool {
        goal: goal.name.clone(),
        descriptor: Tool {
            annotations: None,
            description: Some(description),
            execution: None,
            icons: Vec::new(),
            input_schema,
            meta: None,
            name,
            output_schema: None,
            title: None,
        },
        validator,
    })
}

fn registered_resource(address: &str) -> Result<RegisteredResource, EngineError> {
    let uri = target_uri(address);
    let descriptor: Resource = serde_json::from_value(json!({
        "name": address,
        "uri": uri,
        "mimeType": TARGET_MIME_TYPE,
        "description": format!("Metadata for build target {address}"),
    }))
    .map_err(|err| EngineError::Invalid(format!("resource for {address}: {err}")))?;

    Ok(RegisteredResource {
        address: address.to_string(),
        descriptor,
    })
}
