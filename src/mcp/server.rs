//! MCP request dispatch.
//!
//! [`McpServer`] is shared by every client; it owns nothing per client. Each
//! client gets a [`Connection`] that tracks the lifecycle:
//!
//! 1. **Awaiting initialisation**: only `initialize` is accepted; every other
//!    method fails with not-initialized.
//! 2. **Running**: set exactly once by a successful `initialize`; tools can be
//!    listed and called, concurrently.
//!
//! Every failure is turned into an id-correlated error response here.
//! [`McpServer::dispatch`] additionally catches panics, so nothing a handler
//! does can take a transport down.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::mcp::protocol::{
    parse_bytes, IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, OutgoingMessage, RequestId, MCP_PROTOCOL_VERSION, SERVER_NAME,
    SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::registry::{panic_message, ToolRegistry};

/// Lifecycle state of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Only `initialize` is accepted.
    AwaitingInit,
    /// Tools may be listed and called.
    Running,
}

/// Capabilities returned from `initialize`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    pub tools: ToolCapabilities,
}

impl Default for ServerCapabilities {
    fn default() -> Self {
        Self {
            tools: ToolCapabilities { list_changed: true },
        }
    }
}

/// The `tools` capability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCapabilities {
    /// Modules can be reloaded, so the tool list is announced as mutable.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// `serverInfo` in the `initialize` result.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `clientInfo` sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `initialize` params.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Version the client asks for; echoed back when supported.
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub client_info: Option<ClientInfo>,
}

/// `tools/call` params.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    /// Namespaced tool name.
    pub name: String,
    /// Defaults to an empty object.
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug)]
struct ConnectionInner {
    state: ConnectionState,
    protocol_version: Option<String>,
    client: Option<ClientInfo>,
    client_capabilities: Value,
}

/// Per-client protocol state.
#[derive(Debug)]
pub struct Connection {
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    /// Creates an uninitialised connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::AwaitingInit,
                protocol_version: None,
                client: None,
                client_capabilities: Value::Null,
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Returns `true` once `initialize` has succeeded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// The negotiated protocol version.
    #[must_use]
    pub fn protocol_version(&self) -> Option<String> {
        self.inner.lock().protocol_version.clone()
    }

    /// The client's self-description from `initialize`.
    #[must_use]
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.inner.lock().client.clone()
    }

    /// Client metadata captured at initialisation.
    #[must_use]
    pub fn client_metadata(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "clientInfo": inner.client,
            "protocolVersion": inner.protocol_version,
            "capabilities": inner.client_capabilities,
        })
    }

    /// Moves to `Running`. Returns `false` if the connection was already initialised.
    fn initialize(&self, version: String, params: InitializeParams) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::AwaitingInit {
            return false;
        }
        inner.state = ConnectionState::Running;
        inner.protocol_version = Some(version);
        inner.client = params.client_info;
        inner.client_capabilities = params.capabilities;
        true
    }

    /// Ensures the connection is in the Running state.
    fn require_running(&self, id: &RequestId, method: &str) -> Result<(), JsonRpcError> {
        if self.state() != ConnectionState::Running {
            return Err(JsonRpcError::not_initialized(Some(id.clone()), method));
        }
        Ok(())
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatches JSON-RPC messages to the tool registry.
#[derive(Debug)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    info: ServerInfo,
}

impl McpServer {
    /// Creates a server serving the tools in `registry`.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            info: ServerInfo::default(),
        }
    }

    /// The registry this server dispatches to.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Parses and dispatches raw bytes.
    ///
    /// Returns the message to send back, or `None` for notifications.
    pub async fn handle_bytes(&self, conn: &Connection, bytes: &[u8]) -> Option<OutgoingMessage> {
        match parse_bytes(bytes) {
            Ok(msg) => self.dispatch(conn, msg).await,
            Err(error) => {
                debug!(error = %error.error.message, "Rejected unparseable message");
                Some(error.into())
            }
        }
    }

    /// Dispatches a parsed message, converting a panic into an internal error.
    ///
    /// Returns `None` for notifications, which never get a reply.
    pub async fn dispatch(&self, conn: &Connection, msg: IncomingMessage) -> Option<OutgoingMessage> {
        let id = msg.id().cloned();
        let method = msg.method().to_string();

        match AssertUnwindSafe(self.handle_message(conn, msg))
            .catch_unwind()
            .await
        {
            Ok(reply) => reply,
            Err(payload) => {
                error!(
                    method = %method,
                    panic = %panic_message(payload),
                    "Request handler panicked"
                );
                id.map(|id| {
                    JsonRpcError::internal_error(Some(id), format!("Internal error handling '{method}'"))
                        .into()
                })
            }
        }
    }

    async fn handle_message(&self, conn: &Connection, msg: IncomingMessage) -> Option<OutgoingMessage> {
        match msg {
            IncomingMessage::Request(req) => Some(match self.handle_request(conn, &req).await {
                Ok(response) => response.into(),
                Err(error) => {
                    debug!(id = %req.id, method = %req.method, kind = ?error.error.kind(), "Request failed");
                    error.into()
                }
            }),
            IncomingMessage::Notification(notif) => {
                Self::handle_notification(&notif);
                None
            }
        }
    }

    /// Everything except `initialize` requires a running connection.
    async fn handle_request(
        &self,
        conn: &Connection,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        if req.method == "initialize" {
            return self.handle_initialize(conn, req);
        }

        conn.require_running(&req.id, &req.method)?;

        match req.method.as_str() {
            "tools/list" => Ok(self.handle_tools_list(req)),
            "tools/call" => self.handle_tools_call(req).await,
            _ => Err(JsonRpcError::method_not_found(req.id.clone(), &req.method)),
        }
    }

    /// Notifications are logged only; none change connection state.
    fn handle_notification(notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => debug!("Client reported initialised"),
            "notifications/cancelled" => {
                let request_id = notif
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .cloned()
                    .unwrap_or(Value::Null);
                info!(request_id = %request_id, "Client cancelled request");
            }
            other => debug!(method = %other, "Ignoring notification"),
        }
    }

    /// Negotiates the protocol version and moves the connection to `Running`.
    fn handle_initialize(
        &self,
        conn: &Connection,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        let already = || JsonRpcError::invalid_request(Some(req.id.clone()), "Server already initialised");
        if conn.is_initialized() {
            return Err(already());
        }

        let params: InitializeParams = req
            .params
            .as_ref()
            .map(|p| serde_json::from_value(p.clone()))
            .transpose()
            .map_err(|e| {
                JsonRpcError::invalid_params(
                    req.id.clone(),
                    format!("Invalid initialize params: {e}"),
                )
            })?
            .ok_or_else(|| {
                JsonRpcError::invalid_params(req.id.clone(), "Missing initialize params")
            })?;

        let negotiated_version = if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            params.protocol_version.clone()
        } else {
            MCP_PROTOCOL_VERSION.to_string()
        };
        let client = params.client_info.clone();

        if !conn.initialize(negotiated_version.clone(), params) {
            return Err(already());
        }

        info!(
            client = client.as_ref().map_or("unknown", |c| c.name.as_str()),
            protocol_version = %negotiated_version,
            "Client initialised"
        );

        let result = json!({
            "protocolVersion": negotiated_version,
            "capabilities": ServerCapabilities::default(),
            "serverInfo": self.info,
        });

        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    fn handle_tools_list(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let result = json!({
            "tools": self.registry.list(),
        });

        JsonRpcResponse::success(req.id.clone(), result)
    }

    /// Missing or null arguments become `{}`.
    async fn handle_tools_call(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, JsonRpcError> {
        let params: ToolCallParams = req
            .params
            .as_ref()
            .map(|p| serde_json::from_value(p.clone()))
            .transpose()
            .map_err(|e| {
                JsonRpcError::invalid_params(
                    req.id.clone(),
                    format!("Invalid tool call params: {e}"),
                )
            })?
            .ok_or_else(|| {
                JsonRpcError::invalid_params(req.id.clone(), "Missing tool call params")
            })?;

        let arguments = match params.arguments {
            None | Some(Value::Null) => json!({}),
            Some(args @ Value::Object(_)) => args,
            Some(_) => {
                return Err(JsonRpcError::invalid_params(
                    req.id.clone(),
                    "Tool arguments must be an object",
                ))
            }
        };

        debug!(id = %req.id, tool = %params.name, "Calling tool");
        let result = self
            .registry
            .call(&params.name, arguments)
            .await
            .map_err(|e| JsonRpcError::from_tool_error(req.id.clone(), &e))?;

        let result_value = serde_json::to_value(&result).map_err(|e| {
            error!(error = %e, "Failed to serialise tool call result");
            JsonRpcError::internal_error(
                Some(req.id.clone()),
                "Internal error: failed to serialise result",
            )
        })?;

        Ok(JsonRpcResponse::success(req.id.clone(), result_value))
    }
}
