//! Tool invocation: argument validation, goal execution, outcome mapping.
//!
//! A goal that runs and fails is still a protocol-level success; the failure
//! travels inside the tool result with `isError` set and the goal's own
//! diagnostics as content. Only malformed calls become JSON-RPC errors.

use crate::engine::{normalize_address, BuildEngine, EngineError, GoalInvocation, GoalOutcome};
use crate::mcp::registry::RegisteredTool;
use rust_mcp_schema::{ContentBlock, RpcError, TextContent};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run one tool call end to end. `arguments` is the raw `arguments` object
/// from `tools/call`; the engine is only reached once it validates.
pub async fn call_tool(
    engine: &dyn BuildEngine,
    tool: &RegisteredTool,
    arguments: Value,
    cancel: CancellationToken,
) -> Result<Value, RpcError> {
    if let Err(reason) = tool.validate_arguments(&arguments) {
        debug!(tool = %tool.descriptor.name, %reason, "Rejected tool arguments");
        return Err(RpcError::invalid_params().with_message(&format!(
            "Invalid arguments for {}: {reason}",
            tool.descriptor.name
        )));
    }

    let invocation = invocation_from_arguments(&tool.goal, &arguments);
    info!(goal = %invocation.goal, target = ?invocation.target_address, "Invoking goal");

    match engine.invoke_goal(invocation, cancel).await {
        Ok(outcome) => Ok(outcome_result(&tool.goal, &outcome)),
        Err(EngineError::Cancelled) => {
            Err(RpcError::internal_error().with_message("Invocation cancelled"))
        }
        Err(err) => Ok(failure_result(&tool.goal, &err)),
    }
}

fn invocation_from_arguments(goal: &str, arguments: &Value) -> GoalInvocation {
    let target_address = arguments
        .get("target_address")
        .and_then(Value::as_str)
        .map(normalize_address);
    let extra_args = arguments
        .get("extra_args")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    GoalInvocation {
        goal: goal.to_string(),
        target_address,
        extra_args,
    }
}

/// Map a finished goal run onto a `CallToolResult` document.
fn outcome_result(goal: &str, outcome: &GoalOutcome) -> Value {
    let mut content = Vec::new();
    if !outcome.stdout.is_empty() {
        content.push(text_block(&outcome.stdout));
    }
    if !outcome.stderr.is_empty() {
        content.push(text_block(&outcome.stderr));
    }
    if content.is_empty() {
        content.push(text_block(&format!(
            "{goal} exited with code {}",
            outcome.exit_code
        )));
    }

    json!({
        "content": content,
        "isError": !outcome.succeeded(),
        "structuredContent": {
            "exit_code": outcome.exit_code,
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
        }
    })
}

/// Engine-side failures are business outcomes, not protocol errors.
fn failure_result(goal: &str, err: &EngineError) -> Value {
    json!({
        "content": [text_block(&format!("{goal} failed: {err}"))],
        "isError": true,
    })
}

fn text_block(text: &str) -> Value {
    match serde_json::to_value(ContentBlock::TextContent(TextContent::new(
        text.to_string(),
        None,
        None,
    ))) {
        Ok(value) => value,
        Err(_) => json!({"type": "text", "text": text}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::FakeEngine;
    use crate::mcp::registry::CapabilityRegistry;

    async fn sample_registry(engine: &FakeEngine) -> CapabilityRegistry {
        CapabilityRegistry::build(engine, "goal-")
            .await
            .expect("build registry")
    }

    #[tokio::test]
    async fn successful_goal_reports_exit_code_zero() {
        let engine = FakeEngine::sample();
        let registry = sample_registry(&engine).await;
        let tool = registry.resolve_tool("goal-test").expect("tool");

        let result = call_tool(
            &engine,
            tool,
            json!({"target_address": "//pkg:lib"}),
            CancellationToken::new(),
        )
        .await
        .expect("call");

        assert_eq!(result["isError"], json!(false));
        assert_eq!(result["structuredContent"]["exit_code"], json!(0));
        assert_eq!(engine.invocation_count().await, 1);

        let invocations = engine.invocations.lock().await;
        assert_eq!(invocations[0].goal, "test");
        assert_eq!(invocations[0].target_address.as_deref(), Some("//pkg:lib"));
    }

    #[tokio::test]
    async fn result_document_parses_as_call_tool_result() {
        let engine = FakeEngine::sample();
        let registry = sample_registry(&engine).await;
        let tool = registry.resolve_tool("goal-lint").expect("tool");

        let result = call_tool(
            &engine,
            tool,
            json!({"target_address": "pkg:lib"}),
            CancellationToken::new(),
        )
        .await
        .expect("call");

        serde_json::from_value::<rust_mcp_schema::CallToolResult>(result)
            .expect("wire-compatible result");
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_engine() {
        let engine = FakeEngine::sample();
        let registry = sample_registry(&engine).await;
        let tool = registry.resolve_tool("goal-test").expect("tool");

        let err = call_tool(&engine, tool, json!({}), CancellationToken::new())
            .await
            .expect_err("missing target_address");

        assert!(err.message.contains("target_address"), "got: {}", err.message);
        assert_eq!(engine.invocation_count().await, 0);
    }

    #[tokio::test]
    async fn failed_goal_is_a_successful_response_with_is_error() {
        let engine = FakeEngine::sample().with_outcome(
            "test",
            GoalOutcome {
                exit_code: 1,
                stdout: String::new(),
                stderr: "2 tests failed\n".to_string(),
            },
        );
        let registry = sample_registry(&engine).await;
        let tool = registry.resolve_tool("goal-test").expect("tool");

        let result = call_tool(
            &engine,
            tool,
            json!({"target_address": "//pkg:lib"}),
            CancellationToken::new(),
        )
        .await
        .expect("protocol-level success");

        assert_eq!(result["isError"], json!(true));
        let diagnostics = result["content"].as_array().expect("content");
        assert!(!diagnostics.is_empty());
        assert!(diagnostics[0]["text"]
            .as_str()
            .expect("text")
            .contains("2 tests failed"));
    }

    #[tokio::test]
    async fn engine_failure_becomes_failed_result() {
        let engine = FakeEngine::sample();
        let registry = sample_registry(&engine).await;
        // Resolve against a registry built before the goal disappeared.
        let stale_engine = FakeEngine::empty();
        let tool = registry.resolve_tool("goal-test").expect("tool");

        let result = call_tool(
            &stale_engine,
            tool,
            json!({"target_address": "//pkg:lib"}),
            CancellationToken::new(),
        )
        .await
        .expect("protocol-level success");

        assert_eq!(result["isError"], json!(true));
    }

    #[tokio::test]
    async fn extra_args_pass_through() {
        let engine = FakeEngine::sample();
        let registry = sample_registry(&engine).await;
        let tool = registry.resolve_tool("goal-test").expect("tool");

        call_tool(
            &engine,
            tool,
            json!({"target_address": "//pkg:lib", "extra_args": ["--force"]}),
            CancellationToken::new(),
        )
        .await
        .expect("call");

        let invocations = engine.invocations.lock().await;
        assert_eq!(invocations[0].extra_args, vec!["--force"]);
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_error() {
        let engine = FakeEngine::sample().with_hanging_goal("test");
        let registry = sample_registry(&engine).await;
        let tool = registry.resolve_tool("goal-test").expect("tool");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = call_tool(
            &engine,
            tool,
            json!({"target_address": "//pkg:lib"}),
            cancel,
        )
        .await
        .expect_err("cancelled");
        assert!(err.message.contains("cancelled"));
    }
}
