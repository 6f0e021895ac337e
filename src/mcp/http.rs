//! Streamable HTTP transport.
//!
//! One endpoint (default `/mcp`) carries the whole conversation:
//!
//! - `POST` sends one JSON-RPC message. An `initialize` request creates a
//!   session whose id comes back in the `Mcp-Session-Id` header; every other
//!   message must carry that header. Replies are a single JSON body, or an
//!   SSE stream when the client prefers `text/event-stream`.
//! - `GET` with `Accept: text/event-stream` opens a push channel for
//!   server-initiated notifications.
//! - `DELETE` terminates the session and closes its channels.
//!
//! Origin checking and rate limiting run as middleware in front of the
//! handlers. `GET /health` reports sessions and module health.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::mcp::protocol::{
    parse_bytes, JsonRpcError, OutgoingMessage, OutgoingNotification, RequestId,
};
use crate::mcp::server::{Connection, McpServer};
use crate::modules::ModuleLoader;
use crate::registry::ToolRegistry;
use crate::security::{OriginCheck, OriginPolicy, RateLimiter};
use crate::session::{PushChannel, SessionManager};

/// Header carrying the session id.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Default endpoint path.
pub const DEFAULT_ENDPOINT: &str = "/mcp";

const EVENT_STREAM: &str = "text/event-stream";

/// Shared state of the HTTP transport.
#[derive(Clone)]
pub struct HttpState {
    server: Arc<McpServer>,
    sessions: Arc<SessionManager>,
    loader: Option<Arc<ModuleLoader>>,
    origins: Arc<OriginPolicy>,
    limiter: Option<Arc<RateLimiter>>,
    stream_responses: bool,
}

impl HttpState {
    /// Creates state with the default origin policy and no rate limiting.
    #[must_use]
    pub fn new(server: Arc<McpServer>, sessions: Arc<SessionManager>) -> Self {
        Self {
            server,
            sessions,
            loader: None,
            origins: Arc::new(OriginPolicy::default()),
            limiter: None,
            stream_responses: false,
        }
    }

    /// Reports the loader's modules on `/health`.
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Sets the origin allow-list.
    #[must_use]
    pub fn with_origins(mut self, origins: OriginPolicy) -> Self {
        self.origins = Arc::new(origins);
        self
    }

    /// Enables rate limiting.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Streams replies to clients that accept both JSON and SSE.
    #[must_use]
    pub const fn with_stream_responses(mut self, enabled: bool) -> Self {
        self.stream_responses = enabled;
        self
    }

    /// The session manager.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The rate limiter, if enabled.
    #[must_use]
    pub const fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }
}

/// Builds the router serving `endpoint` and `/health`.
pub fn build_router(state: HttpState, endpoint: &str) -> Router {
    Router::new()
        .route(
            endpoint,
            get(open_stream).post(handle_post).delete(terminate),
        )
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), check_origin))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Serves HTTP on `bind` until `shutdown` is cancelled.
///
/// Runs the session sweeper and forwards registry changes to open push
/// channels while serving. On shutdown every session is terminated so open
/// streams end and the server can drain.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn serve_http(
    state: HttpState,
    bind: SocketAddr,
    endpoint: &str,
    sweep_interval: Duration,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, endpoint, "HTTP transport listening");

    let sweeper = state.sessions.spawn_sweeper(
        sweep_interval,
        state.limiter.clone(),
        shutdown.clone(),
    );
    let forwarder = spawn_change_forwarder(
        Arc::clone(state.server.registry()),
        Arc::clone(&state.sessions),
        shutdown.clone(),
    );

    let sessions = Arc::clone(&state.sessions);
    let app = build_router(state, endpoint);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        let closed = sessions.close_all();
        info!(sessions = closed, "Shutdown requested, closing HTTP transport");
    })
    .await;

    sweeper.abort();
    forwarder.abort();
    result
}

/// Sends `notifications/tools/list_changed` to every open push channel
/// whenever the registry changes.
pub fn spawn_change_forwarder(
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut changes = registry.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let message = OutgoingNotification::tools_list_changed().into();
                        let delivered = sessions.broadcast(&message);
                        debug!(delivered, "Forwarded tool list change");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn json_reply(status: StatusCode, message: impl Into<OutgoingMessage>) -> Response {
    (status, Json(message.into())).into_response()
}

fn session_error(id: Option<RequestId>, error: &SessionError) -> Response {
    let status = match error {
        SessionError::Missing => StatusCode::BAD_REQUEST,
        SessionError::Invalid { .. } => StatusCode::NOT_FOUND,
    };
    json_reply(status, JsonRpcError::from_session_error(id, error))
}

fn session_id(headers: &HeaderMap) -> Result<&str, SessionError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(SessionError::Missing)
}

fn accepts(headers: &HeaderMap, media_type: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.split(';').next().unwrap_or_default().trim())
        .any(|v| v.eq_ignore_ascii_case(media_type))
}

fn accepts_json(headers: &HeaderMap) -> bool {
    !headers.contains_key(header::ACCEPT)
        || accepts(headers, "application/json")
        || accepts(headers, "*/*")
}

fn sse_response(channel: PushChannel) -> Response {
    let stream = futures_util::stream::unfold(channel, |mut channel| async move {
        let message = channel.recv().await?;
        let event = Event::default().event("message").json_data(&message);
        Some((event, channel))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_post(State(state): State<HttpState>, headers: HeaderMap, body: Bytes) -> Response {
    let msg = match parse_bytes(&body) {
        Ok(msg) => msg,
        Err(error) => return json_reply(StatusCode::BAD_REQUEST, error),
    };

    if msg.is_initialize() {
        let conn = Arc::new(Connection::new());
        let Some(reply) = state.server.dispatch(&conn, msg).await else {
            return StatusCode::ACCEPTED.into_response();
        };
        if reply.is_error() {
            return json_reply(StatusCode::OK, reply);
        }
        let session = state.sessions.create(conn);
        let mut response = json_reply(StatusCode::OK, reply);
        if let Ok(value) = HeaderValue::from_str(session.id()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        return response;
    }

    let lease = match session_id(&headers).and_then(|id| state.sessions.acquire(id)) {
        Ok(lease) => lease,
        Err(error) => {
            debug!(method = %msg.method(), error = %error, "Rejected request without a valid session");
            return session_error(msg.id().cloned(), &error);
        }
    };

    if msg.id().is_none() {
        state.server.dispatch(lease.connection(), msg).await;
        return StatusCode::ACCEPTED.into_response();
    }

    let stream = accepts(&headers, EVENT_STREAM) && (state.stream_responses || !accepts_json(&headers));
    if stream {
        let channel = lease.session().open_channel();
        let tx = channel.sender();
        let channel = channel.into_reply_stream();
        let server = Arc::clone(&state.server);
        tokio::spawn(async move {
            if let Some(reply) = server.dispatch(lease.connection(), msg).await {
                let _ = tx.send(reply).await;
            }
        });
        return sse_response(channel);
    }

    match state.server.dispatch(lease.connection(), msg).await {
        Some(reply) => json_reply(StatusCode::OK, reply),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn open_stream(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    if !accepts(&headers, EVENT_STREAM) {
        return (
            StatusCode::NOT_ACCEPTABLE,
            "push channels require Accept: text/event-stream",
        )
            .into_response();
    }

    match session_id(&headers).and_then(|id| state.sessions.acquire(id)) {
        Ok(lease) => sse_response(lease.session().open_channel()),
        Err(error) => session_error(None, &error),
    }
}

async fn terminate(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    match session_id(&headers) {
        Ok(id) if state.sessions.destroy(id) => StatusCode::NO_CONTENT.into_response(),
        Ok(id) => session_error(None, &SessionError::Invalid { id: id.to_string() }),
        Err(error) => session_error(None, &error),
    }
}

async fn health(State(state): State<HttpState>) -> Json<serde_json::Value> {
    let modules = state
        .loader
        .as_ref()
        .map(|loader| loader.statuses())
        .unwrap_or_default();
    Json(json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "modules": modules,
    }))
}

async fn check_origin(State(state): State<HttpState>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    match state.origins.check(origin, host) {
        OriginCheck::Allowed => next.run(request).await,
        OriginCheck::Rejected(origin) => {
            warn!(origin = %origin, path = %request.uri().path(), "Rejected request from disallowed origin");
            json_reply(StatusCode::FORBIDDEN, JsonRpcError::origin_rejected(&origin))
        }
    }
}

async fn rate_limit(State(state): State<HttpState>, request: Request, next: Next) -> Response {
    let Some(limiter) = &state.limiter else {
        return next.run(request).await;
    };

    // Only live sessions get their own bucket; anything else is keyed by peer.
    let key = request
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| state.sessions.is_valid(id))
        .map(str::to_string)
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());

    match limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(wait) => {
            let retry_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            let retry_secs = (wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1);
            let mut response =
                json_reply(StatusCode::TOO_MANY_REQUESTS, JsonRpcError::rate_limited(retry_ms));
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
            response
        }
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        "HTTP request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{handler_fn, HandlerError, Tool};
    use crate::telemetry::TracingTelemetry;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    const BOTH: &str = "application/json, text/event-stream";

    fn add_tool() -> Tool {
        Tool::new(
            "math:add",
            "Adds two integers",
            json!({
                "type": "object",
                "properties": { "a": { "type": "integer" }, "b": { "type": "integer" } },
                "required": ["a", "b"]
            }),
            handler_fn(|args| async move {
                let sum = args["a"].as_i64().unwrap_or_default() + args["b"].as_i64().unwrap_or_default();
                Ok::<_, HandlerError>(json!(sum))
            }),
        )
    }

    fn state_with_timeout(timeout: Duration) -> HttpState {
        let registry = Arc::new(ToolRegistry::default());
        registry.register(add_tool(), false).unwrap();
        let server = Arc::new(McpServer::new(registry));
        let sessions = Arc::new(SessionManager::new(timeout, Arc::new(TracingTelemetry)));
        HttpState::new(server, sessions)
    }

    fn state() -> HttpState {
        state_with_timeout(Duration::from_secs(60))
    }

    fn post(body: &Value, session: Option<&str>, accept: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(DEFAULT_ENDPOINT)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, accept);
        if let Some(id) = session {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn with_session(method: &str, session: &str, accept: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(DEFAULT_ENDPOINT)
            .header(SESSION_HEADER, session)
            .header(header::ACCEPT, accept)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn initialize(app: &Router) -> String {
        let request = post(
            &json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": { "protocolVersion": "2025-03-26", "clientInfo": { "name": "test" } }
            }),
            None,
            BOTH,
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.headers()[SESSION_HEADER].to_str().unwrap().to_string()
    }

    fn call_add(id: i64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": "math:add", "arguments": { "a": 2, "b": 3 } }
        })
    }

    #[tokio::test]
    async fn initialize_creates_session() {
        let state = state();
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);

        let session = initialize(&app).await;

        assert_eq!(session.len(), 32);
        assert!(state.sessions().is_valid(&session));
        assert_eq!(state.sessions().len(), 1);
    }

    #[tokio::test]
    async fn failed_initialize_creates_no_session() {
        let state = state();
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);
        let request = post(
            &json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
            None,
            BOTH,
        );

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key(SESSION_HEADER));
        assert_eq!(body_json(response).await["error"]["code"], -32602);
        assert!(state.sessions().is_empty());
    }

    #[tokio::test]
    async fn requests_need_a_valid_session() {
        let app = build_router(state(), DEFAULT_ENDPOINT);
        let list = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });

        let response = app.clone().oneshot(post(&list, None, BOTH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["error"]["data"]["kind"], "session-invalid");

        let response = app.oneshot(post(&list, Some("nope"), BOTH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], -32020);
    }

    #[tokio::test]
    async fn calls_tool_within_session() {
        let app = build_router(state(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;

        let response = app
            .oneshot(post(&call_add(7), Some(&session), BOTH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], 7);
        assert_eq!(body["result"]["structuredContent"], 5);
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let app = build_router(state(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;
        let notification = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });

        let response = app
            .oneshot(post(&notification, Some(&session), BOTH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_a_parse_error() {
        let app = build_router(state(), DEFAULT_ENDPOINT);
        let request = Request::builder()
            .method("POST")
            .uri(DEFAULT_ENDPOINT)
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn streams_reply_when_client_prefers_sse() {
        let state = state();
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;

        let response = app
            .oneshot(post(&call_add(3), Some(&session), EVENT_STREAM))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with(EVENT_STREAM));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let data = text
            .lines()
            .find_map(|line| line.strip_prefix("data: "))
            .unwrap();
        let reply: Value = serde_json::from_str(data).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["result"]["structuredContent"], 5);
        assert_eq!(state.sessions().get(&session).unwrap().channel_count(), 0);
    }

    #[tokio::test]
    async fn terminate_ends_in_flight_streamed_reply() {
        let state = state();
        state
            .server
            .registry()
            .register(
                Tool::new(
                    "slow:wait",
                    "Never finishes",
                    json!({ "type": "object" }),
                    handler_fn(|_| async {
                        std::future::pending::<()>().await;
                        Ok::<_, HandlerError>(Value::Null)
                    }),
                ),
                false,
            )
            .unwrap();
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;
        let call = json!({
            "jsonrpc": "2.0",
            "id": 11,
            "method": "tools/call",
            "params": { "name": "slow:wait", "arguments": {} }
        });

        let stream = app
            .clone()
            .oneshot(post(&call, Some(&session), EVENT_STREAM))
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);
        assert_eq!(state.sessions().get(&session).unwrap().channel_count(), 1);

        let response = app
            .oneshot(with_session("DELETE", &session, BOTH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let body = tokio::time::timeout(Duration::from_secs(2), stream.into_body().collect())
            .await
            .expect("stream still open after DELETE")
            .unwrap()
            .to_bytes();
        assert!(!String::from_utf8_lossy(&body).contains("data:"));
    }

    #[tokio::test]
    async fn push_channel_lifecycle() {
        let state = state();
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;

        let response = app
            .clone()
            .oneshot(with_session("GET", &session, "application/json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);

        let response = app
            .clone()
            .oneshot(with_session("GET", "unknown", EVENT_STREAM))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let stream = app
            .clone()
            .oneshot(with_session("GET", &session, EVENT_STREAM))
            .await
            .unwrap();
        assert_eq!(stream.status(), StatusCode::OK);
        assert_eq!(state.sessions().get(&session).unwrap().channel_count(), 1);

        let response = app
            .clone()
            .oneshot(with_session("DELETE", &session, BOTH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let remaining = stream.into_body().collect().await.unwrap().to_bytes();
        assert!(remaining.is_empty());

        let response = app
            .oneshot(with_session("DELETE", &session, BOTH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn tool_changes_reach_push_channels() {
        let state = state();
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;
        let shutdown = CancellationToken::new();
        let forwarder = spawn_change_forwarder(
            Arc::clone(state.server.registry()),
            Arc::clone(state.sessions()),
            shutdown.clone(),
        );

        let stream = app
            .oneshot(with_session("GET", &session, EVENT_STREAM))
            .await
            .unwrap();
        state.server.registry().unregister("math:add");

        let mut body = stream.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
        assert!(text.contains("notifications/tools/list_changed"));

        shutdown.cancel();
        forwarder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires() {
        let app = build_router(state_with_timeout(Duration::from_secs(5)), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        let response = app
            .oneshot(post(&call_add(9), Some(&session), BOTH))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["id"], 9);
        assert_eq!(body["error"]["data"]["kind"], "session-invalid");
    }

    #[tokio::test]
    async fn foreign_origin_is_rejected() {
        let app = build_router(state(), DEFAULT_ENDPOINT);
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["error"]["data"]["kind"], "origin-rejected");
    }

    #[tokio::test]
    async fn rate_limit_returns_retry_hint() {
        let state = state().with_rate_limiter(Arc::new(RateLimiter::new(1.0, 1)));
        let app = build_router(state, DEFAULT_ENDPOINT);
        let health = || Request::builder().uri("/health").body(Body::empty()).unwrap();

        let first = app.clone().oneshot(health()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(health()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[header::RETRY_AFTER], "1");
        let body = body_json(second).await;
        assert_eq!(body["error"]["data"]["kind"], "rate-limited");
        assert!(body["error"]["data"]["retryAfterMs"].as_u64().unwrap() <= 1000);
    }

    #[tokio::test]
    async fn unknown_session_ids_share_the_peer_bucket() {
        let state = state().with_rate_limiter(Arc::new(RateLimiter::new(1.0, 1)));
        let app = build_router(state.clone(), DEFAULT_ENDPOINT);
        let health = |session: String| {
            Request::builder()
                .uri("/health")
                .header(SESSION_HEADER, session)
                .body(Body::empty())
                .unwrap()
        };

        let mut accepted = 0;
        for i in 0..20 {
            let response = app.clone().oneshot(health(format!("fake-{i}"))).await.unwrap();
            if response.status() == StatusCode::OK {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(state.limiter().unwrap().tracked(), 1);
    }

    #[tokio::test]
    async fn live_sessions_get_their_own_bucket() {
        let limited = state();
        let app = build_router(limited.clone(), DEFAULT_ENDPOINT);
        let session = initialize(&app).await;
        let limited = limited.with_rate_limiter(Arc::new(RateLimiter::new(1.0, 1)));
        let app = build_router(limited, DEFAULT_ENDPOINT);
        let list = json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" });

        let anonymous = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(anonymous).await.unwrap().status(), StatusCode::OK);

        let response = app.clone().oneshot(post(&list, Some(&session), BOTH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app.oneshot(post(&list, Some(&session), BOTH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let state = state();
        let app = build_router(state, DEFAULT_ENDPOINT);
        initialize(&app).await;

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let body = body_json(app.oneshot(request).await.unwrap()).await;

        assert_eq!(body, json!({ "status": "ok", "sessions": 1, "modules": [] }));
    }

    #[tokio::test]
    async fn unsupported_method_is_not_allowed() {
        let app = build_router(state(), DEFAULT_ENDPOINT);
        let request = Request::builder()
            .method("PUT")
            .uri(DEFAULT_ENDPOINT)
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
