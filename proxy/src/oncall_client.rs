//! Client for the external service.
//!
//! Failures are reported to the caller and never retried here.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use std::io::Write;
use std::time::{Duration, Instant};

use crate::config::OnCallConfig;
use crate::headers::json_content_type;
use crate::metrics_defs::{ONCALL_REQUEST_DURATION, ONCALL_REQUESTS};
use directory::settings::EffectiveSettings;
use shared::http::join_path;
use shared::{counter, histogram};

const HEALTH_PATH: &str = "api/internal/v1/health/";
const INSTALL_PATH: &str = "api/internal/v1/plugin/v2/install";
const SYNC_PATH: &str = "api/internal/v1/plugin/v2/sync";
const STATUS_PATH: &str = "api/internal/v1/plugin/v2/status";

#[derive(thiserror::Error, Debug)]
pub enum OnCallError {
    #[error("invalid external service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned status {status}")]
    UnexpectedStatus {
        endpoint: &'static str,
        status: StatusCode,
    },
    #[error("could not read {endpoint} response: {source}")]
    Body {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("could not encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not compress request body: {0}")]
    Compress(#[from] std::io::Error),
}

/// Status and complete body of a call whose outcome the caller interprets.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct OnCallClient {
    client: reqwest::Client,
    health_timeout: Duration,
    api_timeout: Duration,
}

impl OnCallClient {
    pub fn new(client: reqwest::Client, config: &OnCallConfig) -> Self {
        OnCallClient {
            client,
            health_timeout: config.health_timeout(),
            api_timeout: config.api_timeout(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        self.api_timeout
    }

    /// Sends a request built elsewhere, returning the response unread.
    pub async fn execute(
        &self,
        endpoint: &'static str,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, OnCallError> {
        let start = Instant::now();
        let result = self.client.execute(request).await;
        histogram!(ONCALL_REQUEST_DURATION, "endpoint" => endpoint)
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                counter!(ONCALL_REQUESTS, "endpoint" => endpoint, "outcome" => "response")
                    .increment(1);
                Ok(response)
            }
            Err(source) => {
                counter!(ONCALL_REQUESTS, "endpoint" => endpoint, "outcome" => "error")
                    .increment(1);
                Err(OnCallError::Request { endpoint, source })
            }
        }
    }

    async fn send(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, OnCallError> {
        let request = request
            .build()
            .map_err(|source| OnCallError::Request { endpoint, source })?;
        self.execute(endpoint, request).await
    }

    async fn read(endpoint: &'static str, response: reqwest::Response) -> Result<Reply, OnCallError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| OnCallError::Body { endpoint, source })?;
        Ok(Reply { status, body })
    }

    /// Checks that the external service answers its health endpoint.
    pub async fn health(&self, settings: &EffectiveSettings) -> Result<(), OnCallError> {
        const ENDPOINT: &str = "health";
        let url = join_path(&settings.oncall_api_url, HEALTH_PATH)?;
        let request = self.client.get(url).timeout(self.health_timeout);
        let response = self.send(ENDPOINT, request).await?;

        if !response.status().is_success() {
            return Err(OnCallError::UnexpectedStatus {
                endpoint: ENDPOINT,
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Starts provisioning. The reply is returned whatever its status.
    pub async fn install(
        &self,
        settings: &EffectiveSettings,
        headers: HeaderMap,
    ) -> Result<Reply, OnCallError> {
        const ENDPOINT: &str = "install";
        let url = join_path(&settings.oncall_api_url, INSTALL_PATH)?;
        let request = self
            .client
            .post(url)
            .headers(headers)
            .json(settings)
            .timeout(self.api_timeout);
        let response = self.send(ENDPOINT, request).await?;
        Self::read(ENDPOINT, response).await
    }

    /// Fetches the external service's own view of the connection.
    pub async fn engine_status(
        &self,
        settings: &EffectiveSettings,
        headers: HeaderMap,
    ) -> Result<Reply, OnCallError> {
        const ENDPOINT: &str = "status";
        let url = join_path(&settings.oncall_api_url, STATUS_PATH)?;
        let request = self
            .client
            .get(url)
            .headers(headers)
            .header(CONTENT_TYPE, json_content_type())
            .timeout(self.api_timeout);
        let response = self.send(ENDPOINT, request).await?;
        Self::read(ENDPOINT, response).await
    }

    /// Pushes a directory snapshot, gzip-compressed when `gzip` is set.
    pub async fn push_sync<T: Serialize>(
        &self,
        settings: &EffectiveSettings,
        headers: HeaderMap,
        snapshot: &T,
        gzip: bool,
    ) -> Result<(), OnCallError> {
        const ENDPOINT: &str = "sync";
        let url = join_path(&settings.oncall_api_url, SYNC_PATH)?;
        let json = serde_json::to_vec(snapshot)?;

        let mut request = self
            .client
            .post(url)
            .headers(headers)
            .header(CONTENT_TYPE, json_content_type())
            .timeout(self.api_timeout);
        request = if gzip {
            request
                .header(CONTENT_ENCODING, HeaderValue::from_static("gzip"))
                .body(compress(&json)?)
        } else {
            request.body(json)
        };

        let response = self.send(ENDPOINT, request).await?;
        if !response.status().is_success() {
            return Err(OnCallError::UnexpectedStatus {
                endpoint: ENDPOINT,
                status: response.status(),
            });
        }
        Ok(())
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
