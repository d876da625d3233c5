//! HTTP client for the remote catalog.
//!
//! Fetches the manifest document and raw artifact bytes by logical path
//! with a bearer token and the device id attached. The client is
//! stateless between calls and performs no retries; the orchestrator
//! owns the retry policy and the backoff clock.

use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::CatalogConfig;
use crate::manifest::MANIFEST_PATH;

/// Size cap applied to manifest bodies.
const MANIFEST_BODY_LIMIT: u64 = 256 * 1024;

/// Slack on top of the artifact bound for transfer framing; anything
/// larger than the configured artifact size still fails verification,
/// this only keeps a runaway body from exhausting memory first.
const ARTIFACT_BODY_ALLOWANCE: u64 = 512;

/// Classified transport failures. Everything here is opaque to callers
/// beyond its kind; the orchestrator maps kinds to retry decisions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog is unreachable")]
    NotConnected,
    #[error("catalog request timed out")]
    Timeout,
    #[error("catalog returned HTTP {0}")]
    HttpStatus(u16),
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: u64 },
    #[error("malformed catalog response")]
    MalformedResponse,
}

/// Blocking catalog client bound to one base URL and token.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    base_url: String,
    bearer_token: String,
    device_id: String,
    manifest_timeout: Duration,
    artifact_timeout: Duration,
    artifact_limit: u64,
    http: Client,
}

impl CatalogClient {
    pub fn new(config: &CatalogConfig, max_artifact_size: u64) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("airlift/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            device_id: config.device_id.clone(),
            manifest_timeout: config.manifest_timeout,
            artifact_timeout: config.artifact_timeout,
            artifact_limit: max_artifact_size + ARTIFACT_BODY_ALLOWANCE,
            http,
        })
    }

    /// Fetch the manifest document body.
    pub fn fetch_manifest(&self) -> Result<Vec<u8>, CatalogError> {
        self.get(MANIFEST_PATH, self.manifest_timeout, MANIFEST_BODY_LIMIT)
    }

    /// Fetch one artifact's raw bytes by catalog path.
    pub fn fetch_artifact(&self, path: &str) -> Result<Vec<u8>, CatalogError> {
        self.get(path, self.artifact_timeout, self.artifact_limit)
    }

    fn get(&self, path: &str, timeout: Duration, limit: u64) -> Result<Vec<u8>, CatalogError> {
        let url = format!("{}/{}", self.base_url, path);

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .header("x-device-id", &self.device_id)
            .timeout(timeout)
            .send()
            .map_err(classify_request_error)?;

        match resp.status() {
            StatusCode::OK => {}
            status => return Err(CatalogError::HttpStatus(status.as_u16())),
        }

        if let Some(length) = resp.content_length() {
            if length > limit {
                return Err(CatalogError::BodyTooLarge { limit });
            }
        }

        // Bound the read regardless of what Content-Length claimed.
        let mut body = Vec::new();
        resp.take(limit + 1)
            .read_to_end(&mut body)
            .map_err(|e| classify_body_error(&e))?;
        if body.len() as u64 > limit {
            return Err(CatalogError::BodyTooLarge { limit });
        }

        Ok(body)
    }
}

fn classify_request_error(err: reqwest::Error) -> CatalogError {
    if err.is_timeout() {
        CatalogError::Timeout
    } else if err.is_connect() || err.is_request() {
        CatalogError::NotConnected
    } else {
        CatalogError::MalformedResponse
    }
}

fn classify_body_error(err: &std::io::Error) -> CatalogError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        CatalogError::Timeout
    } else {
        CatalogError::MalformedResponse
    }
}
