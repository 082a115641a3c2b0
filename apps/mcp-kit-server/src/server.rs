use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::sync::{Mutex, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use mcp_kit_coord::{InstanceManager, MCP_ENDPOINT_PATH, run_stdio_server, shutdown_signal};
use mcp_kit_proto::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, McpConnection,
    McpHandler, McpServerConfig,
};

/// Window between accepting a shutdown/transition and forcing the process
/// out, so a wedged drain cannot hold the port hostage.
const CLEANUP_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Shutdown,
    Transition,
}

#[derive(Clone)]
pub struct ServerState {
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    sessions: Arc<Mutex<HashMap<String, McpConnection>>>,
    version: String,
    /// Present only when the coordination core is enabled.
    control: Option<mpsc::Sender<ControlCommand>>,
}

impl ServerState {
    pub fn new(
        cfg: McpServerConfig,
        handler: Arc<dyn McpHandler>,
        control: Option<mpsc::Sender<ControlCommand>>,
    ) -> Self {
        let version = cfg.server_info.version.clone();
        Self {
            cfg,
            handler,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            version,
            control,
        }
    }
}

pub fn router(state: ServerState) -> Router {
    let mut app = Router::new().route(
        MCP_ENDPOINT_PATH,
        post(mcp_post).get(mcp_get).delete(mcp_delete),
    );

    if state.control.is_some() {
        app = app
            .route("/__version", get(control_version))
            .route("/__shutdown", post(control_shutdown))
            .route("/__transition", post(control_transition));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run as the elected primary: MCP plus control endpoints on the shared
/// loopback port, releasing the lock on the way out.
///
/// In stdio mode the HTTP side serves other instances while the local
/// client is answered over stdin/stdout; either side ending tears both
/// down.
pub async fn run_primary(
    mut mgr: InstanceManager,
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    stdio_mode: bool,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<ControlCommand>(1);
    let state = ServerState::new(cfg.clone(), handler.clone(), Some(tx.clone()));
    let app = router(state);

    let port = mgr.target_port();
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("bind shared port {port}"))?;
    info!(port, "primary serving MCP and control endpoints");

    let lock = mgr.lock_store().clone();
    let shutdown = async move {
        let cmd = tokio::select! {
            cmd = rx.recv() => cmd.unwrap_or(ControlCommand::Shutdown),
            _ = shutdown_signal() => ControlCommand::Shutdown,
        };
        match cmd {
            ControlCommand::Transition => info!("yielding the primary role to a newer instance"),
            ControlCommand::Shutdown => info!("primary shutting down"),
        }

        // Release the lock before draining so a successor can elect itself
        // while in-flight requests finish.
        if let Err(e) = lock.remove().await {
            warn!(error = %e, "failed to remove lock during shutdown");
        }

        tokio::spawn(async {
            tokio::time::sleep(CLEANUP_WINDOW).await;
            warn!("cleanup window elapsed, forcing exit");
            std::process::exit(0);
        });
    };

    if stdio_mode {
        let http = tokio::spawn(async move {
            axum::serve(listener, app).with_graceful_shutdown(shutdown).await
        });

        // Foreground: the local stdio client, served by the same handler.
        let stdio_result = run_stdio_server(cfg, handler).await;

        // The stdio client left (EOF or signal); take the HTTP side down.
        let _ = tx.try_send(ControlCommand::Shutdown);
        http.await.context("join http task")?.context("serve http")?;
        stdio_result
    } else {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .context("serve http")?;
        Ok(())
    }
}

/// Plain single-instance HTTP server: no election, no control endpoints.
pub async fn serve_plain(
    port: u16,
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
) -> anyhow::Result<()> {
    let state = ServerState::new(cfg, handler, None);
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .with_context(|| format!("bind port {port}"))?;
    info!(port, "serving MCP over http");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve http")?;
    Ok(())
}

async fn control_version(State(st): State<ServerState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({ "version": st.version }))
}

async fn control_shutdown(State(st): State<ServerState>) -> StatusCode {
    info!("shutdown requested over the control plane");
    notify(&st, ControlCommand::Shutdown)
}

async fn control_transition(State(st): State<ServerState>) -> StatusCode {
    info!("version transition requested over the control plane");
    notify(&st, ControlCommand::Transition)
}

fn notify(st: &ServerState, cmd: ControlCommand) -> StatusCode {
    match &st.control {
        Some(tx) => {
            // A full channel means a command is already being honored.
            let _ = tx.try_send(cmd);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn mcp_get() -> impl IntoResponse {
    // No server-initiated stream on this surface.
    (StatusCode::METHOD_NOT_ALLOWED, "sse not supported")
}

async fn mcp_delete(State(st): State<ServerState>, headers: HeaderMap) -> Response {
    let Some(sid) = header_str(&headers, "mcp-session-id") else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };
    st.sessions.lock().await.remove(sid);
    StatusCode::ACCEPTED.into_response()
}

async fn mcp_post(State(st): State<ServerState>, headers: HeaderMap, body: String) -> Response {
    if let Err((code, msg)) = validate_origin(&headers) {
        return (code, msg).into_response();
    }

    if let Some(v) = header_str(&headers, "mcp-protocol-version")
        && v.trim().is_empty()
    {
        return (StatusCode::BAD_REQUEST, "invalid mcp-protocol-version").into_response();
    }

    let value: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            let resp = JsonRpcResponse::err(JsonRpcId::Null, JsonRpcError::parse_error(e.to_string()));
            return jsonrpc_http_response(resp, None);
        }
    };

    if value.is_array() {
        let resp = JsonRpcResponse::err(
            JsonRpcId::Null,
            JsonRpcError::invalid_request("batching not supported"),
        );
        return jsonrpc_http_response(resp, None);
    }

    let msg: JsonRpcMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            let resp = JsonRpcResponse::err(
                JsonRpcId::Null,
                JsonRpcError::with_detail(-32600, "invalid request", e.to_string()),
            );
            return jsonrpc_http_response(resp, None);
        }
    };

    // Initialize opens a new session.
    if let JsonRpcMessage::Request(JsonRpcRequest { method, .. }) = &msg
        && method == "initialize"
    {
        let sid = Uuid::new_v4().to_string();
        let mut conn = McpConnection::new(st.cfg.clone(), st.handler.clone());
        let resp = conn.handle_message(msg).await;
        st.sessions.lock().await.insert(sid.clone(), conn);
        return match resp {
            Some(r) => jsonrpc_http_response(r, Some(&sid)),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    // Everything else runs inside an existing session.
    let Some(sid) = header_str(&headers, "mcp-session-id") else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id").into_response();
    };

    let mut sessions = st.sessions.lock().await;
    let Some(conn) = sessions.get_mut(sid) else {
        return (StatusCode::NOT_FOUND, "unknown mcp-session-id").into_response();
    };

    match msg {
        JsonRpcMessage::Notification(_) => {
            conn.handle_message(msg).await;
            StatusCode::ACCEPTED.into_response()
        }
        _ => match conn.handle_message(msg).await {
            Some(r) => jsonrpc_http_response(r, Some(sid)),
            None => StatusCode::ACCEPTED.into_response(),
        },
    }
}

fn validate_origin(headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let Some(origin) = headers
        .get("origin")
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.trim().is_empty())
    else {
        return Ok(());
    };

    let url = url::Url::parse(origin).map_err(|_| (StatusCode::FORBIDDEN, "invalid origin"))?;
    let host = url.host().ok_or((StatusCode::FORBIDDEN, "invalid origin"))?;
    let is_loopback = match host {
        url::Host::Domain(d) => d.eq_ignore_ascii_case("localhost"),
        url::Host::Ipv4(ip) => ip.is_loopback(),
        url::Host::Ipv6(ip) => ip.is_loopback(),
    };
    if !is_loopback {
        return Err((StatusCode::FORBIDDEN, "origin not allowed"));
    }
    Ok(())
}

fn jsonrpc_http_response(resp: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let body = serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string());
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json");

    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        builder = builder.header("mcp-session-id", v);
    }

    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}
