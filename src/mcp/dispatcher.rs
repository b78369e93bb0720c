//! Concurrent request dispatch.
//!
//! Each request runs in its own task under a per-request cancellation
//! token. The pending map enforces one outstanding handler per request id
//! and lets `notifications/cancelled` reach the right task. Responses are
//! correlated purely by id; completion order is whatever it is.

use crate::core::config::{Config, RegistryRefresh};
use crate::engine::{BuildEngine, EngineError};
use crate::mcp::protocol::{invalid_request, methods, parse_params, serialize_result, Outgoing};
use crate::mcp::registry::CapabilityRegistry;
use crate::mcp::resources::read_resource;
use crate::mcp::tools::call_tool;
use crate::mcp::transport::FrameWriter;
use futures_util::future;
use rust_mcp_schema::{
    CallToolRequestParams, ListResourcesResult, ListToolsResult, PaginatedRequestParams,
    ReadResourceRequestParams, RequestId, RpcError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct PendingRequest {
    method: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Run a future until it completes or the token fires; `None` means
/// cancelled and the caller must not respond.
pub async fn run_cancellable<F, T>(token: CancellationToken, future: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        _ = token.cancelled() => None,
        value = future => Some(value),
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn BuildEngine>,
    config: Arc<Config>,
    registry: Arc<Mutex<Option<Arc<CapabilityRegistry>>>>,
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
    writer: FrameWriter,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn BuildEngine>, config: Arc<Config>, writer: FrameWriter) -> Self {
        Dispatcher {
            engine,
            config,
            registry: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            writer,
        }
    }

    /// Build the capability snapshot; called once when the handshake lands.
    pub async fn build_registry(&self) -> Result<(), EngineError> {
        let registry =
            CapabilityRegistry::build(self.engine.as_ref(), self.config.tool_prefix()).await?;
        *self.registry.lock().await = Some(Arc::new(registry));
        Ok(())
    }

    /// Spawn a handler for one gated request. A duplicate outstanding id is
    /// answered with a protocol error and no handler runs for it.
    pub async fn dispatch_request(&self, id: RequestId, method: String, params: Option<Value>) {
        let mut pending = self.pending.lock().await;
        if let Some(existing) = pending.get(&id) {
            warn!(?id, method = %existing.method, "Duplicate outstanding request id");
            drop(pending);
            self.send(Outgoing::error(
                id,
                invalid_request("Duplicate outstanding request id"),
            ))
            .await;
            return;
        }

        let cancel = CancellationToken::new();
        let dispatcher = self.clone();
        let task_cancel = cancel.clone();
        let task_id = id.clone();
        let task_method = method.clone();
        let handle = tokio::spawn(async move {
            let outcome = run_cancellable(
                task_cancel.clone(),
                dispatcher.handle(&task_method, params, task_cancel.clone()),
            )
            .await;
            // The handler branch can win the select even after the token
            // fires; a cancelled id still gets no response.
            let outcome = if task_cancel.is_cancelled() {
                None
            } else {
                outcome
            };

            match outcome {
                Some(Ok(result)) => {
                    dispatcher
                        .send(Outgoing::result(task_id.clone(), result))
                        .await
                }
                Some(Err(error)) => {
                    dispatcher
                        .send(Outgoing::error(task_id.clone(), error))
                        .await
                }
                None => debug!(id = ?task_id, "Response suppressed after cancellation"),
            }

            dispatcher.pending.lock().await.remove(&task_id);
        });

        pending.insert(
            id,
            PendingRequest {
                method,
                cancel,
                handle,
            },
        );
    }

    /// Best-effort cancellation; false when the id is not in flight.
    pub async fn cancel_request(&self, id: &RequestId) -> bool {
        let pending = self.pending.lock().await;
        match pending.get(id) {
            Some(request) => {
                debug!(?id, method = %request.method, "Cancelling in-flight request");
                request.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Cancel every in-flight handler without waiting for them.
    pub async fn cancel_in_flight(&self) {
        let pending = self.pending.lock().await;
        for request in pending.values() {
            request.cancel.cancel();
        }
    }

    /// Wait for in-flight handlers up to the grace period, then cancel the
    /// stragglers.
    pub async fn drain(&self, grace: Duration) {
        let entries: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, request)| request).collect()
        };
        if entries.is_empty() {
            return;
        }

        let tokens: Vec<CancellationToken> =
            entries.iter().map(|request| request.cancel.clone()).collect();
        let handles: Vec<JoinHandle<()>> =
            entries.into_iter().map(|request| request.handle).collect();

        if tokio::time::timeout(grace, future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                remaining = tokens.len(),
                "Shutdown grace period elapsed; cancelling in-flight requests"
            );
            for token in tokens {
                token.cancel();
            }
        }
    }

    async fn handle(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, RpcError> {
        match method {
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let _params: PaginatedRequestParams = parse_params(params)?;
                let registry = self.snapshot(true).await?;
                serialize_result(&ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: registry.wire_tools(),
                })
            }
            methods::RESOURCES_LIST => {
                let _params: PaginatedRequestParams = parse_params(params)?;
                let registry = self.snapshot(true).await?;
                serialize_result(&ListResourcesResult {
                    meta: None,
                    next_cursor: None,
                    resources: registry.wire_resources(),
                })
            }
            methods::TOOLS_CALL => {
                let params: CallToolRequestParams = parse_params(params)?;
                let registry = self.snapshot(false).await?;
                let tool = registry.resolve_tool(&params.name).ok_or_else(|| {
                    RpcError::invalid_params()
                        .with_message(&format!("Unknown tool: {}", params.name))
                })?;
                let arguments = params
                    .arguments
                    .map(Value::Object)
                    .unwrap_or_else(|| json!({}));
                call_tool(self.engine.as_ref(), tool, arguments, cancel).await
            }
            methods::RESOURCES_READ => {
                let params: ReadResourceRequestParams = parse_params(params)?;
                let registry = self.snapshot(false).await?;
                read_resource(self.engine.as_ref(), &registry, &params.uri).await
            }
            other => {
                Err(RpcError::method_not_found().with_message(&format!("Unknown method: {other}")))
            }
        }
    }

    /// Current registry snapshot. In per-list mode, listing requests rebuild
    /// it first; resolution always uses whatever snapshot is current.
    async fn snapshot(&self, listing: bool) -> Result<Arc<CapabilityRegistry>, RpcError> {
        if listing && self.config.registry_refresh == RegistryRefresh::PerList {
            let rebuilt = CapabilityRegistry::build(
                self.engine.as_ref(),
                self.config.tool_prefix(),
            )
            .await
            .map_err(|err| {
                RpcError::internal_error()
                    .with_message(&format!("Failed to refresh registry: {err}"))
            })?;
            let shared = Arc::new(rebuilt);
            *self.registry.lock().await = Some(shared.clone());
            return Ok(shared);
        }

        self.registry.lock().await.clone().ok_or_else(|| {
            RpcError::internal_error().with_message("Capability registry not built")
        })
    }

    pub async fn send(&self, outgoing: Outgoing) {
        match outgoing.to_frame() {
            Ok(frame) => {
                if !self.writer.send(&frame).await {
                    warn!(id = ?outgoing.id(), "Transport closed before response could be sent");
                }
            }
            Err(err) => error!(error = %err, "Failed to serialize response frame"),
        }
    }
}
