//! Resource reads: target metadata as deterministic JSON documents.
//!
//! Metadata is fetched fresh on every read; determinism comes from the
//! serialization (fixed field order, sorted attribute keys), so a target
//! that has not changed reads back byte-identical.

use crate::engine::{BuildEngine, EngineError, TargetMetadata};
use crate::mcp::protocol::resource_not_found;
use crate::mcp::registry::CapabilityRegistry;
use crate::mcp::TARGET_MIME_TYPE;
use rust_mcp_schema::RpcError;
use serde_json::{json, Value};
use tracing::debug;

pub async fn read_resource(
    engine: &dyn BuildEngine,
    registry: &CapabilityRegistry,
    uri: &str,
) -> Result<Value, RpcError> {
    let address = match registry.resolve_resource(uri) {
        Some(resource) => resource.address.clone(),
        None => {
            debug!(%uri, "Resource not in registry");
            return Err(resource_not_found(uri));
        }
    };

    let metadata = engine
        .target_metadata(&address)
        .await
        .map_err(|err| match err {
            EngineError::NotFound(_) => resource_not_found(uri),
            other => RpcError::internal_error()
                .with_message(&format!("Failed to read {uri}: {other}")),
        })?;

    let text = render_metadata(&metadata)?;
    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": TARGET_MIME_TYPE,
            "text": text,
        }]
    }))
}

fn render_metadata(metadata: &TargetMetadata) -> Result<String, RpcError> {
    serde_json::to_string(metadata).map_err(|err| {
        RpcError::internal_error().with_message(&format!("Failed to serialize metadata: {err}"))
    })
}
