use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context as _;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Informational annotations stamped onto forwarded requests.
#[derive(Debug, Clone)]
pub struct ProxyMetadata {
    pub main_version: String,
    pub main_port: u16,
    pub instance_id: String,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Port the proxy listens on; 0 asks the kernel for one.
    pub listen_port: u16,
    /// Loopback port of the primary everything is forwarded to.
    pub target_port: u16,
    pub metadata: Option<ProxyMetadata>,
}

/// Safety-net timeout for a single forwarded exchange.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct ProxyState {
    http: reqwest::Client,
    target_base: String,
    metadata: Option<ProxyMetadata>,
}

/// A running reverse proxy. Dropping the handle aborts the listener; call
/// [`ProxyHandle::stop`] to drain in-flight requests first.
pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Close the listener and wait for in-flight requests to finish.
    /// Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Bind the listen socket and start forwarding to the primary.
pub async fn start(options: ProxyOptions) -> anyhow::Result<ProxyHandle> {
    let http = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        // The downstream client decides what to do with redirects.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("build proxy upstream client")?;

    let state = ProxyState {
        http,
        target_base: format!("http://127.0.0.1:{}", options.target_port),
        metadata: options.metadata,
    };

    let app = Router::new()
        .fallback(forward)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, options.listen_port))
        .await
        .with_context(|| format!("bind proxy listener on port {}", options.listen_port))?;
    let addr = listener.local_addr().context("proxy local addr")?;
    info!(listen = %addr, target = options.target_port, "reverse proxy listening");

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = rx.await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "proxy serve loop ended with error");
        }
    });

    Ok(ProxyHandle {
        addr,
        shutdown: Some(tx),
        task: Some(task),
    })
}

/// Forward one request byte-faithfully and stream the answer back.
async fn forward(State(st): State<ProxyState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", st.target_base, path_and_query);

    let mut headers = strip_hop_headers(&parts.headers);
    // The upstream determines its own Host and framing.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    if let Some(meta) = &st.metadata {
        annotate(&mut headers, meta);
    }

    let upstream = st
        .http
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;

    let upstream = match upstream {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            return bad_gateway(&e);
        }
    };

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    if let Some(out_headers) = builder.headers_mut() {
        *out_headers = strip_hop_headers(upstream.headers());
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out
}

fn annotate(headers: &mut HeaderMap, meta: &ProxyMetadata) {
    let pairs = [
        ("x-proxy-main-version", meta.main_version.clone()),
        ("x-proxy-main-port", meta.main_port.to_string()),
        ("x-proxy-instance-id", meta.instance_id.clone()),
        ("x-proxy-start-time", meta.started_at_ms.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    }
}

fn bad_gateway(err: &reqwest::Error) -> Response {
    let body = serde_json::json!({
        "error": "bad_gateway",
        "message": format!("Proxy error: {err}"),
    });
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
