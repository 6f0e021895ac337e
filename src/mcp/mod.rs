//! Model Context Protocol (MCP) server.
//!
//! The protocol core ([`protocol`] and [`server`]) is transport-agnostic and
//! is fed by two transports:
//!
//! - [`transport`]: newline-delimited JSON over stdin/stdout, one client.
//! - [`http`]: streamable HTTP, many clients, each identified by a session.
//!
//! ```text
//!   stdio ──┐                      ┌──▶ ToolRegistry ──▶ module tools
//!           ├──▶ McpServer ────────┤
//!   HTTP ───┘  (per-client         └──▶ initialize / tools/list
//!               Connection)
//! ```

pub mod http;
pub mod protocol;
pub mod server;
pub mod transport;

pub use http::{build_router, serve_http, HttpState, SESSION_HEADER};
pub use protocol::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, OutgoingMessage, MCP_PROTOCOL_VERSION,
};
pub use server::{Connection, McpServer};
pub use transport::serve_stdio;
