//! Lifecycle control for engines served over HTTP
//!
//! Model servers expose `POST {base}/v1/admin/models/{model}/load` and
//! `/unload`. A server without the admin API (404) keeps its model resident on
//! its own, so load and unload become no-ops there.

use super::Device;
use crate::{ParleyError, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
struct LoadResponse {
    #[serde(default)]
    memory_mb: Option<u64>,
    #[serde(default)]
    size_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct RemoteModel {
    http: reqwest::Client,
    base_url: String,
    model: String,
    device: Device,
    memory_estimate_mb: u64,
}

impl RemoteModel {
    pub fn new(
        base_url: &str,
        model: &str,
        device: &str,
        memory_estimate_mb: u64,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ParleyError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            device: Device::resolve(device, base_url),
            memory_estimate_mb,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn admin_url(&self, action: &str) -> String {
        self.url(&format!("/v1/admin/models/{}/{}", self.model, action))
    }

    pub async fn load(&self) -> Result<u64> {
        let response = self.http.post(self.admin_url("load")).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("{} has no admin API, assuming '{}' is resident", self.base_url, self.model);
            return Ok(self.memory_estimate_mb);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ParleyError::EngineLoadError(format!(
                "{} failed to load '{}' ({}): {}",
                self.base_url, self.model, status, body
            )));
        }

        let info: LoadResponse = response.json().await.unwrap_or_default();
        Ok(info
            .memory_mb
            .or(info.size_bytes.map(|b| b / (1024 * 1024)))
            .unwrap_or(self.memory_estimate_mb))
    }

    pub async fn unload(&self) -> Result<()> {
        let response = self.http.post(self.admin_url("unload")).send().await?;

        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(ParleyError::HttpError(format!(
            "{} failed to unload '{}': {}",
            self.base_url,
            self.model,
            response.status()
        )))
    }
}

/// Read an error body for a failed engine call
pub async fn error_body(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    format!("{} {}", status, body.trim())
}
