//! Chantier is an MCP server that puts a build tool's goals and targets in
//! front of LLM coding agents over a stdio stream pair.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`engine`] defines the `BuildEngine` seam to the underlying build tool
//!   and ships a subprocess-backed implementation.
//! - [`mcp`] implements the protocol side: transport framing, the JSON-RPC
//!   codec, session lifecycle, the capability registry, and the request
//!   dispatcher with its tool and resource handlers.
//! - [`core`] owns configuration loading and persistence.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`], which wires a configured engine into
//! [`mcp::server`] for a stdio session.

pub mod cli;
pub mod core;
pub mod engine;
pub mod logging;
pub mod mcp;
