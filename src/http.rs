//! HTTP client for the remote run service.
//!
//! One pooled [`reqwest::Client`] is built per gateway and reused for every
//! request. Status codes are mapped onto [`NetworkError`] so the job policy
//! can classify them; retries are the job scheduler's concern, not this
//! client's.
//!
//! Endpoints:
//! - `POST /run` multipart: `RUN_DATA` (JSON) + `MAP_PICTURE` (image bytes)
//! - `DELETE /run?id=<id>`
//! - `GET /runs`
//! - `GET /logout`

use std::sync::RwLock;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};

use crate::config::HttpConfig;
use crate::error::NetworkError;
use crate::gateway::{CreateRunRequest, RemoteRunGateway, RunDto};
use crate::types::{Run, RunId};

const RUN_DATA_PART: &str = "RUN_DATA";
const MAP_PICTURE_PART: &str = "MAP_PICTURE";

/// Helper to calculate elapsed milliseconds from an Instant
#[inline]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// reqwest-backed [`RemoteRunGateway`].
pub struct HttpRunGateway {
    client: Client,
    base_url: String,
    /// Full `Authorization` header value ("Bearer ..." or "Basic ...")
    auth_header: RwLock<String>,
}

impl HttpRunGateway {
    pub fn new(config: &HttpConfig, auth_header: impl Into<String>) -> Result<Self, NetworkError> {
        let client = Client::builder()
            .pool_idle_timeout(config.pool_idle_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                warn!("[HttpRunGateway] Failed to create HTTP client: {}", e);
                NetworkError::Unknown
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: RwLock::new(auth_header.into()),
        })
    }

    /// Replace the credentials used for subsequent requests, e.g. after the
    /// host app refreshed its token.
    pub fn set_auth_header(&self, auth_header: impl Into<String>) {
        match self.auth_header.write() {
            Ok(mut guard) => *guard = auth_header.into(),
            Err(poisoned) => *poisoned.into_inner() = auth_header.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let auth = match self.auth_header.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        request.header(reqwest::header::AUTHORIZATION, auth)
    }

    /// Turn a non-success status into the matching error.
    fn check_status(response: Response, what: &str) -> Result<Response, NetworkError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        warn!("[HttpRunGateway] {} failed with status {}", what, status);
        Err(NetworkError::from_status(status.as_u16()))
    }
}

#[async_trait]
impl RemoteRunGateway for HttpRunGateway {
    async fn post_run(&self, run: &Run, map_image: &[u8]) -> Result<Run, NetworkError> {
        let start = Instant::now();
        let body = serde_json::to_string(&CreateRunRequest::from_run(run)?)?;

        let form = Form::new().text(RUN_DATA_PART, body).part(
            MAP_PICTURE_PART,
            Part::bytes(map_image.to_vec())
                .file_name("map.jpg")
                .mime_str("image/jpeg")?,
        );

        let response = self
            .authorized(self.client.post(self.url("/run")))
            .multipart(form)
            .send()
            .await?;
        let response = Self::check_status(response, "POST /run")?;
        let dto: RunDto = response.json().await?;

        debug!(
            "[HttpRunGateway] POST /run {} ({} bytes image, {} ms)",
            dto.id,
            map_image.len(),
            elapsed_ms(start)
        );
        dto.into_run()
    }

    async fn delete_run(&self, id: &RunId) -> Result<(), NetworkError> {
        let start = Instant::now();
        let response = self
            .authorized(self.client.delete(self.url("/run")))
            .query(&[("id", id.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("[HttpRunGateway] DELETE /run {}: already gone", id);
            return Ok(());
        }
        Self::check_status(response, "DELETE /run")?;

        debug!(
            "[HttpRunGateway] DELETE /run {} ({} ms)",
            id,
            elapsed_ms(start)
        );
        Ok(())
    }

    async fn fetch_runs(&self) -> Result<Vec<Run>, NetworkError> {
        let start = Instant::now();
        let response = self
            .authorized(self.client.get(self.url("/runs")))
            .send()
            .await?;
        let response = Self::check_status(response, "GET /runs")?;
        let dtos: Vec<RunDto> = response.json().await?;

        let runs = dtos
            .into_iter()
            .map(RunDto::into_run)
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "[HttpRunGateway] Fetched {} runs ({} ms)",
            runs.len(),
            elapsed_ms(start)
        );
        Ok(runs)
    }

    async fn logout(&self) -> Result<(), NetworkError> {
        let response = self
            .authorized(self.client.get(self.url("/logout")))
            .send()
            .await?;
        Self::check_status(response, "GET /logout")?;
        info!("[HttpRunGateway] Logged out");
        Ok(())
    }
}
