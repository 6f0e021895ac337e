//! Wire types for JSON-RPC 2.0 as spoken by MCP clients.
//!
//! Incoming messages are requests (carry an `id`) or notifications (no `id`).
//! Outgoing messages are success responses, error responses, or
//! server-initiated notifications. Ids are integers or strings. Batches and
//! client-sent responses are rejected as malformed.
//!
//! Every error response carries `error.data.kind`, a stable name clients can
//! branch on.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ErrorKind, ModuleError, SessionError, ToolError};

/// The newest MCP protocol version this implementation supports.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// Every protocol version the server will agree to.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26"];

/// Server name for capability negotiation.
pub const SERVER_NAME: &str = "mcp-plugin-host";

/// Correlates a reply with its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Extracts a usable ID from a raw JSON value.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// A request; the server always answers it.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol marker, `"2.0"`.
    pub jsonrpc: String,

    pub id: RequestId,

    pub method: String,

    /// Object or array, if present.
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Returns the first structural problem, if any.
    #[must_use]
    pub fn validate(&self) -> Option<&'static str> {
        if self.jsonrpc != "2.0" {
            return Some("jsonrpc field must be \"2.0\"");
        }
        if self.method.is_empty() {
            return Some("method field cannot be empty");
        }
        if matches!(self.params, Some(ref p) if !p.is_object() && !p.is_array()) {
            return Some("params must be an object or an array");
        }
        None
    }
}

/// A client notification; never answered.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,

    pub method: String,

    #[serde(default)]
    pub params: Option<Value>,
}

/// A notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingNotification {
    pub jsonrpc: &'static str,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl OutgoingNotification {
    /// Builds a notification for `method`.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }

    /// Tells the client that the set of registered tools changed.
    #[must_use]
    pub fn tools_list_changed() -> Self {
        Self::new("notifications/tools/list_changed", None)
    }
}

/// Reply carrying a method's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,

    pub id: RequestId,

    pub result: Value,
}

impl JsonRpcResponse {
    /// Wraps `result` as the reply to `id`.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Value is not const-compatible
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

/// The `error` member of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcErrorData {
    /// Numeric code derived from the error kind.
    pub code: i32,

    /// Human-readable summary.
    pub message: String,

    /// Structured detail; always includes `kind`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates an error of the given kind with a message and `data.kind` set.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code: kind.code(),
            message: message.into(),
            data: Some(json!({ "kind": kind.as_str() })),
        }
    }

    /// Replaces the error data. The caller is responsible for including `kind`.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns the `data.kind` string, if present.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

/// Reply reporting a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcError {
    pub jsonrpc: &'static str,

    /// Serialised as `null` when the request id could not be recovered.
    pub id: Option<RequestId>,

    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Pairs an error with the id it answers.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // JsonRpcErrorData contains String
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            error,
        }
    }

    /// Body was not JSON. The id is unknowable.
    #[must_use]
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(
            None,
            JsonRpcErrorData::new(ErrorKind::ParseFailure, format!("Parse error: {detail}")),
        )
    }

    /// Message is JSON but not a valid request or notification.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, reason: &str) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::new(
                ErrorKind::MalformedRequest,
                format!("Invalid Request: {reason}"),
            ),
        )
    }

    /// Lists the supported methods alongside the unknown one.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(ErrorKind::UnknownMethod, format!("Method not found: {method}"))
                .with_data(json!({
                    "kind": ErrorKind::UnknownMethod.as_str(),
                    "method": method,
                    "supported": ["initialize", "tools/list", "tools/call"],
                })),
        )
    }

    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(ErrorKind::InvalidParameters, message),
        )
    }

    /// Creates a not-initialised error response.
    #[must_use]
    pub fn not_initialized(id: Option<RequestId>, method: &str) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::new(
                ErrorKind::NotInitialized,
                format!("Server not initialised: call 'initialize' before '{method}'"),
            ),
        )
    }

    /// Failure inside the server rather than in the request.
    #[must_use]
    pub fn internal_error(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(id, JsonRpcErrorData::new(ErrorKind::Internal, message))
    }

    /// Converts a tool registry error into a response.
    #[must_use]
    pub fn from_tool_error(id: RequestId, error: &ToolError) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::new(error.kind(), error.to_string()).with_data(error.data()),
        )
    }

    /// Converts a session error into a response.
    #[must_use]
    pub fn from_session_error(id: Option<RequestId>, error: &SessionError) -> Self {
        Self::new(id, JsonRpcErrorData::new(error.kind(), error.to_string()))
    }

    /// Converts a module error into a response.
    #[must_use]
    pub fn from_module_error(id: Option<RequestId>, error: &ModuleError) -> Self {
        Self::new(id, JsonRpcErrorData::new(error.kind(), error.to_string()))
    }

    /// Creates a rate-limited error carrying a retry hint.
    #[must_use]
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        let kind = ErrorKind::RateLimited;
        Self::new(
            None,
            JsonRpcErrorData::new(kind, format!("Rate limit exceeded, retry in {retry_after_ms}ms"))
                .with_data(json!({ "kind": kind.as_str(), "retryAfterMs": retry_after_ms })),
        )
    }

    /// Creates an origin-rejected error.
    #[must_use]
    pub fn origin_rejected(origin: &str) -> Self {
        let kind = ErrorKind::OriginRejected;
        Self::new(
            None,
            JsonRpcErrorData::new(kind, format!("Origin not allowed: {origin}"))
                .with_data(json!({ "kind": kind.as_str(), "origin": origin })),
        )
    }
}

/// Any message the server sends back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    /// A success response.
    Response(JsonRpcResponse),
    /// An error response.
    Error(JsonRpcError),
    /// A server-initiated notification.
    Notification(OutgoingNotification),
}

impl OutgoingMessage {
    /// Returns `true` for error responses.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<JsonRpcResponse> for OutgoingMessage {
    fn from(response: JsonRpcResponse) -> Self {
        Self::Response(response)
    }
}

impl From<JsonRpcError> for OutgoingMessage {
    fn from(error: JsonRpcError) -> Self {
        Self::Error(error)
    }
}

impl From<OutgoingNotification> for OutgoingMessage {
    fn from(notification: OutgoingNotification) -> Self {
        Self::Notification(notification)
    }
}

/// A parsed client message.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Has an id.
    Request(JsonRpcRequest),
    /// Has no id.
    Notification(JsonRpcNotification),
}

impl IncomingMessage {
    #[must_use]
    pub fn method(&self) -> &str {
        match self {
            Self::Request(req) => &req.method,
            Self::Notification(notif) => &notif.method,
        }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Option::as_ref is not const
    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request(req) => req.params.as_ref(),
            Self::Notification(notif) => notif.params.as_ref(),
        }
    }

    /// `None` for notifications.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Notification(_) => None,
        }
    }

    /// Returns `true` if this is the `initialize` request.
    #[must_use]
    pub fn is_initialize(&self) -> bool {
        matches!(self, Self::Request(req) if req.method == "initialize")
    }
}

/// Parses raw bytes into an incoming message.
///
/// # Errors
///
/// Returns a `JsonRpcError` if the bytes are not UTF-8 JSON or not a valid message.
pub fn parse_bytes(bytes: &[u8]) -> Result<IncomingMessage, JsonRpcError> {
    let value: Value = serde_json::from_slice(bytes).map_err(JsonRpcError::parse_error)?;
    parse_value(value)
}

/// Parses one line of the pipe transport.
///
/// # Errors
///
/// Returns a parse-failure or malformed-request error.
pub fn parse_message(json: &str) -> Result<IncomingMessage, JsonRpcError> {
    parse_bytes(json.as_bytes())
}

/// Validates an already-decoded JSON value as an incoming message.
///
/// # Errors
///
/// Returns a malformed-request error if the value is not a valid message.
pub fn parse_value(value: Value) -> Result<IncomingMessage, JsonRpcError> {
    if value.is_array() {
        return Err(JsonRpcError::invalid_request(
            None,
            "batch requests are not supported",
        ));
    }

    let obj = value
        .as_object()
        .ok_or_else(|| JsonRpcError::invalid_request(None, "message must be a JSON object"))?;

    // Recover the id early so that every later rejection can echo it.
    let raw_id = obj.get("id");
    let id = raw_id.and_then(RequestId::from_value);

    let jsonrpc = obj.get("jsonrpc").and_then(Value::as_str);
    if jsonrpc != Some("2.0") {
        return Err(JsonRpcError::invalid_request(
            id,
            "jsonrpc field must be \"2.0\"",
        ));
    }

    if obj.contains_key("result") || obj.contains_key("error") {
        return Err(JsonRpcError::invalid_request(
            id,
            "responses are not accepted by this server",
        ));
    }

    if raw_id.is_some() {
        if id.is_none() {
            return Err(JsonRpcError::invalid_request(
                None,
                "id must be a string or an integer",
            ));
        }

        let request: JsonRpcRequest = serde_json::from_value(value)
            .map_err(|e| JsonRpcError::invalid_request(id.clone(), &e.to_string()))?;

        if let Some(reason) = request.validate() {
            return Err(JsonRpcError::invalid_request(Some(request.id), reason));
        }

        Ok(IncomingMessage::Request(request))
    } else {
        let notification: JsonRpcNotification = serde_json::from_value(value)
            .map_err(|e| JsonRpcError::invalid_request(None, &e.to_string()))?;

        Ok(IncomingMessage::Notification(notification))
    }
}
