//! HTTP driver for the local embed bridge
//!
//! The host page runs the video embed and exposes it on a localhost REST
//! bridge; this driver talks to that bridge.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use tracing::{debug, instrument, warn};

use super::types::*;
use super::{PlayerDriver, PlayerError, PlayerStatus};

/// Default bridge port
pub const DEFAULT_PORT: u16 = 10780;

/// Short timeouts since the bridge is on localhost
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HttpPlayer {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpPlayer {
    /// Bridge on localhost:10780
    pub fn new() -> Self {
        Self::with_port(DEFAULT_PORT)
    }

    pub fn with_port(port: u16) -> Self {
        // 127.0.0.1 rather than localhost to avoid IPv6 resolution
        Self::with_base_url(format!("http://127.0.0.1:{}", port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/api/v1/player{}", self.base_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(token) = &self.api_token {
            req = req.header("apitoken", token);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, PlayerError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                warn!("Player bridge unreachable: {}", e);
                PlayerError::NotReachable
            } else {
                PlayerError::Http(e)
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = resp
            .json::<ErrorResponse>()
            .await
            .map(|body| body.error)
            .unwrap_or_default();
        match status.as_u16() {
            409 | 425 => Err(PlayerError::NotReady),
            code if message.is_empty() => Err(PlayerError::Api(format!("HTTP {}", code))),
            code => Err(PlayerError::Api(format!("HTTP {}: {}", code, message))),
        }
    }
}

impl Default for HttpPlayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlayerDriver for HttpPlayer {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn load(&self, video_id: &str, start_seconds: Option<f64>) -> Result<(), PlayerError> {
        self.send(self.request(Method::POST, "/load").json(&LoadRequest {
            video_id,
            start_seconds,
        }))
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn play(&self) -> Result<(), PlayerError> {
        self.send(self.request(Method::POST, "/play")).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn pause(&self) -> Result<(), PlayerError> {
        self.send(self.request(Method::POST, "/pause")).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
        self.send(
            self.request(Method::POST, "/seek")
                .json(&SeekRequest { seconds: seconds.max(0.0) }),
        )
        .await?;
        Ok(())
    }

    async fn status(&self) -> Result<PlayerStatus, PlayerError> {
        let resp: ApiResponse<StatusResponse> =
            self.send(self.request(Method::GET, "/status")).await?.json().await?;
        debug!(
            "Player status: {} {:?} at {:.1}s",
            resp.status, resp.data.state, resp.data.current_time
        );
        Ok(resp.data.into())
    }
}
