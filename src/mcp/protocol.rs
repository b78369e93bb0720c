//! JSON-RPC 2.0 envelope codec.
//!
//! Frames are classified here before any method dispatch: well-formed
//! requests and notifications come out typed, everything else comes out as
//! a [`FrameError`] that already says how to answer it. Payloads inside the
//! envelope are `rust_mcp_schema` types, converted at this seam.

use rust_mcp_schema::{RequestId, RpcError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::SUPPORTED_PROTOCOL_VERSIONS;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const RESOURCE_NOT_FOUND: i64 = -32002;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const SHUTDOWN: &str = "shutdown";
    pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIF_CANCELLED: &str = "notifications/cancelled";
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// One inbound frame, already classified.
#[derive(Debug, Clone)]
pub enum Incoming {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A result or error frame. This server never sends requests, so any
    /// response addressed to it is stray and gets dropped after logging.
    Stray,
}

#[derive(Debug)]
pub enum FrameError {
    /// The line was not JSON at all.
    Parse(String),
    /// Valid JSON, but not a JSON-RPC 2.0 message we can act on. When the
    /// frame carried a usable id, the error response can be correlated.
    Invalid {
        id: Option<RequestId>,
        reason: String,
    },
}

impl FrameError {
    /// The error object to send back, paired with the id to address it to
    /// (none means the frame was too broken to correlate).
    pub fn to_rpc_error(&self) -> (Option<RequestId>, RpcError) {
        match self {
            FrameError::Parse(reason) => (
                None,
                RpcError {
                    code: PARSE_ERROR,
                    message: format!("Parse error: {reason}"),
                    data: None,
                },
            ),
            FrameError::Invalid { id, reason } => (
                id.clone(),
                RpcError {
                    code: INVALID_REQUEST,
                    message: format!("Invalid request: {reason}"),
                    data: None,
                },
            ),
        }
    }
}

pub fn parse_incoming(line: &str) -> Result<Incoming, FrameError> {
    let value: Value =
        serde_json::from_str(line).map_err(|err| FrameError::Parse(err.to_string()))?;
    let raw: RawFrame = serde_json::from_value(value).map_err(|err| FrameError::Invalid {
        id: None,
        reason: err.to_string(),
    })?;

    let id = match raw.id {
        None | Some(Value::Null) => None,
        Some(value) => Some(serde_json::from_value::<RequestId>(value).map_err(|_| {
            FrameError::Invalid {
                id: None,
                reason: "id must be a string or an integer".to_string(),
            }
        })?),
    };

    if raw.jsonrpc.as_deref() != Some("2.0") {
        return Err(FrameError::Invalid {
            id,
            reason: "missing or unsupported jsonrpc version".to_string(),
        });
    }

    match (raw.method, id) {
        (Some(method), Some(id)) => Ok(Incoming::Request {
            id,
            method,
            params: raw.params,
        }),
        (Some(method), None) => Ok(Incoming::Notification {
            method,
            params: raw.params,
        }),
        (None, _) if raw.result.is_some() || raw.error.is_some() => Ok(Incoming::Stray),
        (None, id) => Err(FrameError::Invalid {
            id,
            reason: "frame carries neither method nor result".to_string(),
        }),
    }
}

/// One outbound response frame. Exactly one of `result`/`error` is set.
#[derive(Debug, Serialize)]
pub struct Outgoing {
    jsonrpc: &'static str,
    id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Outgoing {
    pub fn result(id: RequestId, result: Value) -> Self {
        Outgoing {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: RequestId, error: RpcError) -> Self {
        Outgoing {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_frame(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|err| err.to_string())
    }
}

pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(value).map_err(|err| {
        RpcError::invalid_params().with_message(&format!("Invalid parameters: {err}"))
    })
}

pub fn serialize_result<T: Serialize>(result: &T) -> Result<Value, RpcError> {
    serde_json::to_value(result).map_err(|err| {
        RpcError::internal_error().with_message(&format!("Failed to serialize result: {err}"))
    })
}

/// Echo a supported protocol revision, or refuse the handshake.
pub fn negotiate_protocol_version(requested: &str) -> Option<&'static str> {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .copied()
        .find(|version| *version == requested)
}

pub fn invalid_request(reason: &str) -> RpcError {
    RpcError {
        code: INVALID_REQUEST,
        message: reason.to_string(),
        data: None,
    }
}

pub fn resource_not_found(uri: &str) -> RpcError {
    RpcError {
        code: RESOURCE_NOT_FOUND,
        message: format!("Resource not found: {uri}"),
        data: None,
    }
}
