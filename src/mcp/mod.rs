//! Model Context Protocol server internals.
//!
//! [`server`] owns the session loop; [`dispatcher`] fans requests out to
//! concurrent handlers; [`tools`] and [`resources`] translate between MCP
//! payloads and the build engine; [`registry`] holds the capability
//! snapshot; [`transport`] and [`protocol`] cover framing and the JSON-RPC
//! envelope.

pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod resources;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

/// URI scheme for target resources (`build-target://pkg:lib`).
pub const TARGET_URI_SCHEME: &str = "build-target://";

/// All target metadata documents are JSON.
pub const TARGET_MIME_TYPE: &str = "application/json";

/// Protocol revisions this server will echo back during the handshake,
/// newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-11-25", "2025-06-18", "2025-03-26"];
