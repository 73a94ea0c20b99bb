//! Upstream MCP transports.
//!
//! Implements the `Transport`/`Session` ports from `upmux-core` for local
//! processes (stdio) and remote endpoints (HTTP, streamable HTTP). Only the
//! `initialize` handshake and `tools/list` are spoken.
#![deny(unused_crate_dependencies)]

pub mod child;
pub mod factory;
pub mod http;
pub mod jsonrpc;
pub mod path;
pub mod stdio;

pub use child::shutdown_child;
pub use factory::McpTransportFactory;
pub use http::{HttpSession, HttpTransport, SESSION_HEADER, parse_resource_metadata};
pub use stdio::{StdioSession, StdioTransport};

#[cfg(test)]
use wiremock as _;
