//! The seam between the protocol server and the underlying build tool.
//!
//! Everything the server knows about builds goes through [`BuildEngine`]:
//! goal discovery, target discovery, target metadata, and goal invocation.
//! The server never interprets build semantics beyond what these calls
//! return.

pub mod process;

#[cfg(test)]
pub mod test_support;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A goal the build tool can run (e.g. `test`, `lint`, `package`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the goal's arguments. When absent, the server falls
    /// back to a schema requiring a single `target_address` string.
    #[serde(default)]
    pub param_schema: Option<serde_json::Value>,
}

/// An addressable unit of the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHandle {
    pub address: String,
}

/// Introspection document for a single target.
///
/// Field order is fixed and `attributes` is a `BTreeMap`, so serializing the
/// same metadata twice yields byte-identical JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub address: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// A validated request to run one goal.
#[derive(Debug, Clone)]
pub struct GoalInvocation {
    pub goal: String,
    pub target_address: Option<String>,
    pub extra_args: Vec<String>,
}

/// What happened when a goal ran. A non-zero exit code is a legitimate
/// outcome, not an engine error.
#[derive(Debug, Clone)]
pub struct GoalOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GoalOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// The named goal or target does not exist.
    NotFound(String),
    /// The engine produced or was handed something structurally wrong.
    Invalid(String),
    /// The engine process could not be driven.
    Io(std::io::Error),
    /// The invocation was cancelled before the engine finished.
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Invalid(reason) => write!(f, "invalid engine data: {reason}"),
            EngineError::Io(source) => write!(f, "engine I/O failure: {source}"),
            EngineError::Cancelled => write!(f, "invocation cancelled"),
        }
    }
}

impl StdError for EngineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            EngineError::Io(source) => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        EngineError::Io(source)
    }
}

/// The only contact surface between the protocol server and build execution.
#[async_trait]
pub trait BuildEngine: Send + Sync {
    async fn list_goals(&self) -> Result<Vec<GoalDescriptor>, EngineError>;

    async fn list_targets(&self) -> Result<Vec<TargetHandle>, EngineError>;

    /// Fetch current metadata for one target. Implementations must not cache;
    /// the caller decides freshness policy.
    async fn target_metadata(&self, address: &str) -> Result<TargetMetadata, EngineError>;

    /// Run one goal to completion or cancellation.
    async fn invoke_goal(
        &self,
        invocation: GoalInvocation,
        cancel: CancellationToken,
    ) -> Result<GoalOutcome, EngineError>;
}

/// Normalize a target address to its absolute `//`-prefixed spelling.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    let stripped = trimmed.trim_start_matches('/');
    format!("//{stripped}")
}
