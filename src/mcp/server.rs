//! The session loop.
//!
//! Reads frames, walks the session state machine, and hands gated requests
//! to the dispatcher. Generic over the stream pair so tests can drive a
//! whole session over in-memory pipes; production wires stdin/stdout.

use crate::core::config::Config;
use crate::engine::BuildEngine;
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::protocol::{
    invalid_request, methods, negotiate_protocol_version, parse_incoming, parse_params,
    serialize_result, Incoming, Outgoing,
};
use crate::mcp::session::Session;
use crate::mcp::transport::{spawn_line_reader, FrameWriter};
use rust_mcp_schema::{
    Implementation, InitializeRequestParams, InitializeResult, RequestId, RpcError,
    ServerCapabilities, ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Serve one session over stdin/stdout, returning when the session closes.
pub async fn run_stdio(engine: Arc<dyn BuildEngine>, config: Arc<Config>) {
    run_session(engine, config, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn run_session<R, W>(
    engine: Arc<dyn BuildEngine>,
    config: Arc<Config>,
    reader: R,
    writer: W,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = spawn_line_reader(reader);
    let frame_writer = FrameWriter::new(writer);
    let dispatcher = Dispatcher::new(engine, config.clone(), frame_writer.clone());
    let mut session = Session::new();
    let grace = Duration::from_millis(config.shutdown_grace_ms());

    loop {
        let line = tokio::select! {
            biased;
            // A dead write side means nobody can observe results; stop
            // accepting input and cancel whatever is still running.
            _ = frame_writer.failed() => {
                warn!("Transport write failed; cancelling in-flight requests");
                dispatcher.cancel_in_flight().await;
                session.close();
                break;
            }
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let incoming = match parse_incoming(&line) {
            Ok(incoming) => incoming,
            Err(frame_error) => {
                let (id, error) = frame_error.to_rpc_error();
                match id {
                    Some(id) => dispatcher.send(Outgoing::error(id, error)).await,
                    None => warn!(message = %error.message, "Dropping uncorrelatable frame"),
                }
                continue;
            }
        };

        match incoming {
            Incoming::Stray => debug!("Dropping stray response frame"),
            Incoming::Notification { method, params } => {
                handle_notification(&dispatcher, &mut session, grace, &method, params).await;
                if session.is_closed() {
                    break;
                }
            }
            Incoming::Request { id, method, params } => {
                if let Err(error) = session.gate_request(&method) {
                    dispatcher.send(Outgoing::error(id, error)).await;
                    continue;
                }

                if method == methods::INITIALIZE {
                    match handle_initialize(&dispatcher, &config, params).await {
                        Ok(result) => {
                            dispatcher.send(Outgoing::result(id, result)).await;
                            session.mark_initialized();
                        }
                        Err(InitializeError::Unsupported(error)) => {
                            dispatcher.send(Outgoing::error(id, error)).await;
                            session.close();
                            break;
                        }
                        Err(InitializeError::Failed(error)) => {
                            dispatcher.send(Outgoing::error(id, error)).await;
                        }
                    }
                } else {
                    dispatcher.dispatch_request(id, method, params).await;
                }
            }
        }
    }

    if !session.is_closed() {
        // Peer hung up without a shutdown notification.
        debug!("Transport closed; draining in-flight requests");
        dispatcher.drain(grace).await;
        session.close();
    }

    info!("Session closed");
}

#[derive(Deserialize)]
struct CancelledParams {
    #[serde(rename = "requestId")]
    request_id: RequestId,
    #[serde(default)]
    reason: Option<String>,
}

async fn handle_notification(
    dispatcher: &Dispatcher,
    session: &mut Session,
    grace: Duration,
    method: &str,
    params: Option<Value>,
) {
    match method {
        methods::SHUTDOWN => {
            info!("Shutdown requested; draining in-flight requests");
            session.begin_shutdown();
            dispatcher.drain(grace).await;
            session.close();
        }
        methods::NOTIF_INITIALIZED => debug!("Peer finished initialization"),
        methods::NOTIF_CANCELLED => match parse_params::<CancelledParams>(params) {
            Ok(cancelled) => {
                let hit = dispatcher.cancel_request(&cancelled.request_id).await;
                if !hit {
                    debug!(
                        id = ?cancelled.request_id,
                        reason = ?cancelled.reason,
                        "Cancellation for unknown or finished request"
                    );
                }
            }
            // Notifications are never answered, not even broken ones.
            Err(error) => debug!(message = %error.message, "Ignoring malformed cancellation"),
        },
        other => debug!(method = other, "Ignoring unknown notification"),
    }
}

enum InitializeError {
    /// Version negotiation failed; the session must close after responding.
    Unsupported(RpcError),
    /// The handshake failed for a recoverable reason; the peer may retry.
    Failed(RpcError),
}

async fn handle_initialize(
    dispatcher: &Dispatcher,
    config: &Config,
    params: Option<Value>,
) -> Result<Value, InitializeError> {
    let params: InitializeRequestParams =
        parse_params(params).map_err(InitializeError::Failed)?;

    let version = negotiate_protocol_version(&params.protocol_version).ok_or_else(|| {
        InitializeError::Unsupported(invalid_request(&format!(
            "Unsupported protocol version: {}",
            params.protocol_version
        )))
    })?;

    info!(
        client = %params.client_info.name,
        version,
        "Initializing session"
    );

    dispatcher.build_registry().await.map_err(|err| {
        InitializeError::Failed(
            RpcError::internal_error()
                .with_message(&format!("Failed to enumerate build capabilities: {err}")),
        )
    })?;

    let result = InitializeResult {
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools::default()),
            resources: Some(ServerCapabilitiesResources::default()),
            ..ServerCapabilities::default()
        },
        instructions: None,
        meta: None,
        protocol_version: version.to_string(),
        server_info: Implementation {
            name: config.server_name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: Some("Exposes build goals and targets over MCP".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
    };
    serialize_result(&result).map_err(InitializeError::Failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::FakeEngine;
    use crate::engine::GoalOutcome;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::task::JoinHandle;

    struct TestClient {
        requests: DuplexStream,
        responses: tokio::io::Lines<BufReader<DuplexStream>>,
        session: JoinHandle<()>,
    }

    impl TestClient {
        async fn send(&mut self, frame: Value) {
            let mut line = frame.to_string();
            line.push('\n');
            self.requests
                .write_all(line.as_bytes())
                .await
                .expect("send frame");
        }

        async fn recv(&mut self) -> Value {
            let line = self
                .responses
                .next_line()
                .await
                .expect("read")
                .expect("frame before eof");
            serde_json::from_str(&line).expect("frame is json")
        }

        /// None once the server has closed its output.
        async fn recv_eof(&mut self) -> Option<String> {
            self.responses.next_line().await.expect("read")
        }

        async fn finish(self) {
            drop(self.requests);
            let _ = self.session.await;
        }

        async fn initialize(&mut self) {
            self.send(json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-11-25",
                    "capabilities": {},
                    "clientInfo": {"name": "test-agent", "version": "0.0.1"}
                }
            }))
            .await;
            let frame = self.recv().await;
            assert_eq!(frame["id"], json!(0), "handshake response: {frame}");
            assert!(frame.get("error").is_none(), "handshake failed: {frame}");
        }
    }

    fn start(engine: Arc<FakeEngine>, config: Config) -> TestClient {
        let (requests, server_in) = tokio::io::duplex(64 * 1024);
        let (server_out_rx, server_out) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(run_session(
            engine as Arc<dyn BuildEngine>,
            Arc::new(config),
            server_in,
            server_out,
        ));
        TestClient {
            requests,
            responses: BufReader::new(server_out_rx).lines(),
            session,
        }
    }

    fn start_sample() -> (Arc<FakeEngine>, TestClient) {
        let engine = Arc::new(FakeEngine::sample());
        let client = start(engine.clone(), Config::default());
        (engine, client)
    }

    #[tokio::test]
    async fn handshake_echoes_version_and_server_info() {
        let engine = Arc::new(FakeEngine::sample());
        let mut client = start(engine, Config::default());

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-11-25",
                    "capabilities": {},
                    "clientInfo": {"name": "test-agent", "version": "0.0.1"}
                }
            }))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["result"]["protocolVersion"], json!("2025-11-25"));
        assert_eq!(frame["result"]["serverInfo"]["name"], json!("chantier"));
        assert!(frame["result"]["capabilities"]["tools"].is_object());
        assert!(frame["result"]["capabilities"]["resources"].is_object());
        client.finish().await;
    }

    #[tokio::test]
    async fn requests_before_handshake_are_rejected_without_side_effects() {
        let (engine, mut client) = start_sample();

        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "goal-test", "arguments": {"target_address": "//pkg:lib"}}}))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["id"], json!(1));
        assert_eq!(frame["error"]["code"], json!(-32600));
        assert_eq!(engine.invocation_count().await, 0);
        client.finish().await;
    }

    #[tokio::test]
    async fn unsupported_protocol_version_closes_the_session() {
        let (_engine, mut client) = start_sample();

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "clientInfo": {"name": "test-agent", "version": "0.0.1"}
                }
            }))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["error"]["code"], json!(-32600));
        assert!(frame["error"]["message"]
            .as_str()
            .expect("message")
            .contains("1999-01-01"));
        assert!(client.recv_eof().await.is_none());
        client.finish().await;
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let (_engine, mut client) = start_sample();
        client.initialize().await;

        client
            .send(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-11-25",
                    "capabilities": {},
                    "clientInfo": {"name": "test-agent", "version": "0.0.1"}
                }
            }))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["error"]["code"], json!(-32600));
        client.finish().await;
    }

    #[tokio::test]
    async fn listings_are_stable_and_sorted() {
        let (_engine, mut client) = start_sample();
        client.initialize().await;

        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
            .await;
        let first = client.recv().await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
            .await;
        let second = client.recv().await;

        let names: Vec<&str> = first["result"]["tools"]
            .as_array()
            .expect("tools")
            .iter()
            .map(|tool| tool["name"].as_str().expect("name"))
            .collect();
        assert_eq!(names, vec!["goal-lint", "goal-test"]);
        assert_eq!(first["result"]["tools"], second["result"]["tools"]);

        client
            .send(json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"}))
            .await;
        let resources = client.recv().await;
        assert_eq!(
            resources["result"]["resources"][0]["uri"],
            json!("build-target://pkg:lib")
        );
        client.finish().await;
    }

    #[tokio::test]
    async fn repeated_resource_reads_are_byte_identical() {
        let (_engine, mut client) = start_sample();
        client.initialize().await;

        let read = json!({"jsonrpc": "2.0", "id": 1, "method": "resources/read",
            "params": {"uri": "build-target://pkg:lib"}});
        client.send(read.clone()).await;
        let first = client.recv().await;
        let mut again = read;
        again["id"] = json!(2);
        client.send(again).await;
        let second = client.recv().await;

        assert_eq!(
            first["result"]["contents"][0]["text"].as_str(),
            second["result"]["contents"][0]["text"].as_str()
        );
        client.finish().await;
    }

    #[tokio::test]
    async fn schema_violations_never_invoke_the_goal() {
        let (engine, mut client) = start_sample();
        client.initialize().await;

        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "goal-test", "arguments": {}}}))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["error"]["code"], json!(-32602));
        assert!(frame["error"]["message"]
            .as_str()
            .expect("message")
            .contains("target_address"));
        assert_eq!(engine.invocation_count().await, 0);
        client.finish().await;
    }

    #[tokio::test]
    async fn failed_goal_travels_as_successful_response() {
        let engine = Arc::new(FakeEngine::sample().with_outcome(
            "lint",
            GoalOutcome {
                exit_code: 1,
                stdout: String::new(),
                stderr: "3 lint errors\n".to_string(),
            },
        ));
        let mut client = start(engine, Config::default());
        client.initialize().await;

        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "goal-lint", "arguments": {"target_address": "//pkg:lib"}}}))
            .await;

        let frame = client.recv().await;
        assert!(frame.get("error").is_none());
        assert_eq!(frame["result"]["isError"], json!(true));
        assert!(frame["result"]["content"][0]["text"]
            .as_str()
            .expect("diagnostics")
            .contains("3 lint errors"));
        client.finish().await;
    }

    #[tokio::test]
    async fn concurrent_requests_complete_out_of_order() {
        let engine = Arc::new(FakeEngine::sample().with_hanging_goal("test"));
        let mut client = start(engine, Config::default());
        client.initialize().await;

        client
            .send(json!({"jsonrpc": "2.0", "id": 10, "method": "tools/call",
                "params": {"name": "goal-test", "arguments": {"target_address": "//pkg:lib"}}}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 11, "method": "tools/list"}))
            .await;

        // The listing overtakes the hanging call.
        let frame = client.recv().await;
        assert_eq!(frame["id"], json!(11));
        assert!(frame["result"]["tools"].is_array());

        client
            .send(json!({"jsonrpc": "2.0", "method": "notifications/cancelled",
                "params": {"requestId": 10, "reason": "peer gave up"}}))
            .await;
        client
            .send(json!({"jsonrpc": "2.0", "id": 12, "method": "ping"}))
            .await;

        // The cancelled call's response is suppressed; the next frame must
        // be the ping's, not id 10's.
        let frame = client.recv().await;
        assert_eq!(frame["id"], json!(12));
        client.finish().await;
    }

    #[tokio::test]
    async fn shutdown_notification_drains_and_closes() {
        let (_engine, mut client) = start_sample();
        client.initialize().await;

        client
            .send(json!({"jsonrpc": "2.0", "method": "shutdown"}))
            .await;

        assert!(client.recv_eof().await.is_none());
        client.finish().await;
    }

    #[tokio::test]
    async fn transport_write_failure_closes_the_session() {
        let engine = Arc::new(FakeEngine::sample());
        let (mut requests, server_in) = tokio::io::duplex(64 * 1024);
        let (responses, server_out) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(run_session(
            engine.clone() as Arc<dyn BuildEngine>,
            Arc::new(Config::default()),
            server_in,
            server_out,
        ));
        // Nobody is reading responses; the first write fails.
        drop(responses);

        for frame in [
            json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-11-25",
                    "capabilities": {},
                    "clientInfo": {"name": "test-agent", "version": "0.0.1"}
                }
            }),
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                "params": {"name": "goal-test", "arguments": {"target_address": "//pkg:lib"}}}),
        ] {
            let mut line = frame.to_string();
            line.push('\n');
            let _ = requests.write_all(line.as_bytes()).await;
        }

        // The session must end on its own, without the input closing, and
        // the queued call must never reach the engine.
        session.await.expect("session task");
        assert_eq!(engine.invocation_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_frames_do_not_kill_the_session() {
        let (_engine, mut client) = start_sample();
        client.initialize().await;

        client.requests.write_all(b"this is not json\n").await.expect("send");
        client
            .send(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["id"], json!(1));
        client.finish().await;
    }

    #[tokio::test]
    async fn unknown_method_after_handshake_is_method_not_found() {
        let (_engine, mut client) = start_sample();
        client.initialize().await;

        client
            .send(json!({"jsonrpc": "2.0", "id": 9, "method": "prompts/list"}))
            .await;

        let frame = client.recv().await;
        assert_eq!(frame["error"]["code"], json!(-32601));
        client.finish().await;
    }
}
