//! HTTP client for the AxeOS status endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use super::{DeviceSnapshot, FetchError, StatusSource, layout};
use crate::config::DeviceConfig;
use crate::tracing::prelude::*;

/// Path of the status endpoint, relative to the device address.
pub const STATUS_PATH: &str = "/api/system/info";

/// Per-request timeout. A device that has not answered by then is
/// treated as unreachable.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fetches device status over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Map a transport error onto the fetch error taxonomy.
    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if err.is_decode() {
            FetchError::InvalidResponse(err.without_url().to_string())
        } else {
            FetchError::Unreachable(err.without_url().to_string())
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Status URL for a configured address.
///
/// A bare host or `host:port` gets `http://`. An address that already
/// carries a scheme is used as the base as-is.
pub fn status_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{address}{STATUS_PATH}")
    } else {
        format!("http://{address}{STATUS_PATH}")
    }
}

#[async_trait]
impl StatusSource for HttpClient {
    async fn fetch(&self, device: &DeviceConfig) -> Result<DeviceSnapshot, FetchError> {
        let url = status_url(&device.address);
        trace!(device = %device.name, %url, "Fetching status");

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let raw: Value = serde_json::from_slice(&body)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        layout::parse(&raw, OffsetDateTime::now_utc())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("192.168.1.50", "http://192.168.1.50/api/system/info" ; "bare ip")]
    #[test_case("bitaxe.local:8080", "http://bitaxe.local:8080/api/system/info" ; "host and port")]
    #[test_case("http://10.0.0.2/", "http://10.0.0.2/api/system/info" ; "scheme and trailing slash")]
    #[test_case(" https://axe.example ", "https://axe.example/api/system/info" ; "https with whitespace")]
    fn builds_status_url(address: &str, expected: &str) {
        assert_eq!(status_url(address), expected);
    }
}
