//! Reverse-proxy fidelity: forwarding, annotation, streaming, failure.

use axum::Router;
use axum::body::Bytes;
use axum::extract::RawQuery;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use tokio::sync::oneshot;

use mcp_kit_coord::{ProxyMetadata, ProxyOptions, start_proxy};

struct Upstream {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Upstream {
    async fn spawn() -> Self {
        let app = Router::new()
            .route("/", get(|| async { "root ok" }))
            .route(
                "/echo",
                post(|body: Bytes| async move { body }),
            )
            .route(
                "/inspect",
                get(|RawQuery(q): RawQuery, headers: HeaderMap| async move {
                    let seen_version = headers
                        .get("x-proxy-main-version")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let seen_port = headers
                        .get("x-proxy-main-port")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let has_instance = headers.contains_key("x-proxy-instance-id");
                    let has_start = headers.contains_key("x-proxy-start-time");
                    axum::Json(serde_json::json!({
                        "query": q,
                        "main_version": seen_version,
                        "main_port": seen_port,
                        "has_instance_id": has_instance,
                        "has_start_time": has_start,
                    }))
                }),
            )
            .route(
                "/bytes",
                get(|| async {
                    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
                    (
                        [(header::CONTENT_TYPE, "application/octet-stream")],
                        payload,
                    )
                        .into_response()
                }),
            )
            .route("/redir", get(|| async { Redirect::temporary("/target") }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let port = listener.local_addr().expect("addr").port();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
        });
        Self {
            port,
            shutdown: Some(tx),
            task,
        }
    }

    async fn kill(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client")
}

fn metadata(port: u16) -> ProxyMetadata {
    ProxyMetadata {
        main_version: "9.9.9".to_string(),
        main_port: port,
        instance_id: "test-instance".to_string(),
        started_at_ms: 1_700_000_000_000,
    }
}

#[tokio::test]
async fn root_request_reaches_the_primary() {
    let upstream = Upstream::spawn().await;
    let mut proxy = start_proxy(ProxyOptions {
        listen_port: 0,
        target_port: upstream.port,
        metadata: None,
    })
    .await
    .expect("start proxy");

    let body = client()
        .get(format!("http://127.0.0.1:{}/", proxy.port()))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "root ok");

    proxy.stop().await;
}

#[tokio::test]
async fn method_path_query_and_metadata_are_forwarded() {
    let upstream = Upstream::spawn().await;
    let mut proxy = start_proxy(ProxyOptions {
        listen_port: 0,
        target_port: upstream.port,
        metadata: Some(metadata(upstream.port)),
    })
    .await
    .expect("start proxy");

    let v: serde_json::Value = client()
        .get(format!("http://127.0.0.1:{}/inspect?a=1&b=2", proxy.port()))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(v["query"], "a=1&b=2");
    assert_eq!(v["main_version"], "9.9.9");
    assert_eq!(v["main_port"], upstream.port.to_string());
    assert_eq!(v["has_instance_id"], true);
    assert_eq!(v["has_start_time"], true);

    proxy.stop().await;
}

#[tokio::test]
async fn request_and_response_bodies_are_byte_faithful() {
    let upstream = Upstream::spawn().await;
    let mut proxy = start_proxy(ProxyOptions {
        listen_port: 0,
        target_port: upstream.port,
        metadata: None,
    })
    .await
    .expect("start proxy");

    // Binary round trip through POST /echo.
    let payload: Vec<u8> = (0..=255u8).rev().cycle().take(10_000).collect();
    let echoed = client()
        .post(format!("http://127.0.0.1:{}/echo", proxy.port()))
        .body(payload.clone())
        .send()
        .await
        .expect("request")
        .bytes()
        .await
        .expect("body");
    assert_eq!(echoed.as_ref(), payload.as_slice());

    // Fixed binary response from GET /bytes.
    let expected: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let got = client()
        .get(format!("http://127.0.0.1:{}/bytes", proxy.port()))
        .send()
        .await
        .expect("request")
        .bytes()
        .await
        .expect("body");
    assert_eq!(got.as_ref(), expected.as_slice());

    proxy.stop().await;
}

#[tokio::test]
async fn upstream_redirects_pass_through_unfollowed() {
    let upstream = Upstream::spawn().await;
    let mut proxy = start_proxy(ProxyOptions {
        listen_port: 0,
        target_port: upstream.port,
        metadata: None,
    })
    .await
    .expect("start proxy");

    let resp = client()
        .get(format!("http://127.0.0.1:{}/redir", proxy.port()))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        resp.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some("/target")
    );

    proxy.stop().await;
}

#[tokio::test]
async fn dead_upstream_yields_502_with_proxy_error_body() {
    let mut upstream = Upstream::spawn().await;
    let mut proxy = start_proxy(ProxyOptions {
        listen_port: 0,
        target_port: upstream.port,
        metadata: None,
    })
    .await
    .expect("start proxy");

    upstream.kill().await;

    let resp = client()
        .get(format!("http://127.0.0.1:{}/", proxy.port()))
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let v: serde_json::Value = resp.json().await.expect("json body");
    assert_eq!(v["error"], "bad_gateway");
    assert!(
        v["message"].as_str().unwrap_or("").contains("Proxy error"),
        "502 body should carry a proxy error message: {v}"
    );

    proxy.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_closes_the_listener() {
    let upstream = Upstream::spawn().await;
    let mut proxy = start_proxy(ProxyOptions {
        listen_port: 0,
        target_port: upstream.port,
        metadata: None,
    })
    .await
    .expect("start proxy");
    let port = proxy.port();

    proxy.stop().await;
    proxy.stop().await;

    let err = client()
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .await;
    assert!(err.is_err(), "listener should be closed after stop");
}
