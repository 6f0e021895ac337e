//! mcp-plugin-host: a pluggable Model Context Protocol server.
//!
//! Tools are contributed by modules. Each module is described by a manifest,
//! ordered by its dependencies, started with its configuration, and registers
//! namespaced tools (`module:tool`) in a shared registry. Clients reach the
//! registry over JSON-RPC through one of two transports.
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and the error taxonomy
//! - [`mcp`]: Protocol core and the stdio and HTTP transports
//! - [`modules`]: Manifests, dependency resolution and module lifecycle
//! - [`registry`]: Namespaced tool registry with timeouts
//! - [`security`]: Origin allow-list and rate limiting
//! - [`session`]: HTTP sessions and push channels
//! - [`telemetry`]: Structured event sink

pub mod config;
pub mod error;
pub mod mcp;
pub mod modules;
pub mod registry;
pub mod security;
pub mod session;
pub mod telemetry;
