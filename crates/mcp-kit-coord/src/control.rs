use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use tracing::debug;

/// Hard per-request timeout for every control-plane call.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: String,
}

/// Loopback HTTP client for the three control endpoints.
///
/// Every failure mode (transport error, timeout, bad status, malformed
/// body) collapses to `None` / `false`; the coordinator interprets those as
/// "unknown" and decides what to do.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build control-plane http client")?;
        Ok(Self { http })
    }

    /// `GET /__version` on the instance holding `port`.
    ///
    /// The body must parse as `{"version": string}`; the Content-Type header
    /// is deliberately not checked.
    pub async fn fetch_version(&self, port: u16) -> Option<String> {
        let resp = match self
            .http
            .get(format!("http://127.0.0.1:{port}/__version"))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(port, error = %e, "version query failed");
                return None;
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            debug!(port, status = %resp.status(), "version query rejected");
            return None;
        }
        match resp.json::<VersionBody>().await {
            Ok(body) => Some(body.version),
            Err(e) => {
                debug!(port, error = %e, "version body unreadable");
                None
            }
        }
    }

    /// `POST /__shutdown`. `true` iff the primary answered 200.
    pub async fn request_shutdown(&self, port: u16) -> bool {
        self.post_ok(port, "__shutdown").await
    }

    /// `POST /__transition`. `true` iff the primary accepted yielding the
    /// port.
    pub async fn request_transition(&self, port: u16) -> bool {
        self.post_ok(port, "__transition").await
    }

    async fn post_ok(&self, port: u16, endpoint: &str) -> bool {
        match self
            .http
            .post(format!("http://127.0.0.1:{port}/{endpoint}"))
            .send()
            .await
        {
            Ok(r) => r.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(port, endpoint, error = %e, "control request failed");
                false
            }
        }
    }
}
