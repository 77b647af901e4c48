//! HTTP client wrapper for transfer requests.
//!
//! Thin wrapper over `reqwest` that applies the engine's connect/read
//! timeouts, attaches per-task headers, issues optional byte-range requests,
//! and maps transport failures onto [`DownloadError`] with context. The
//! executor in [`super::transfer`] owns everything above the request level
//! (resume decisions, chunk streaming, validation).

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument, warn};
use url::Url;

use super::DownloadError;

/// HTTP client with engine-level timeout configuration.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the given connect and read timeouts.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the underlying client cannot be
    /// constructed (TLS backend initialization failure).
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }

    /// Sends a GET request with task headers and an optional resume offset.
    ///
    /// A non-zero `resume_offset` adds `Range: bytes={offset}-`. Auth-class
    /// statuses (401/403/407) are promoted to [`DownloadError::AuthRequired`];
    /// other non-success statuses become [`DownloadError::HttpStatus`] with
    /// any `Retry-After` header captured. A 200 response to a ranged request
    /// is returned as success: the executor handles the restart-from-zero
    /// fallback.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for invalid URLs, transport failures,
    /// timeouts, and error statuses.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        resume_offset: u64,
    ) -> Result<Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut request = self.client.get(url).headers(build_header_map(headers));
        if resume_offset > 0 {
            request = request.header(RANGE, format!("bytes={resume_offset}-"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "request succeeded");
            return Ok(response);
        }

        // Range not satisfiable is a resume-protocol signal, not a task
        // failure; the executor retries the same attempt without a Range.
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(DownloadError::http_status(url, status.as_u16()));
        }

        let status_code = status.as_u16();
        if matches!(status_code, 401 | 403 | 407) {
            let domain = Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(std::string::ToString::to_string))
                .unwrap_or_else(|| url.to_string());
            return Err(DownloadError::auth_required(url, status_code, domain));
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);
        Err(DownloadError::http_status_with_retry_after(
            url,
            status_code,
            retry_after,
        ))
    }
}

/// Builds a `HeaderMap` from task header pairs, skipping malformed entries.
///
/// A header the origin rejects will surface as an HTTP error; a header we
/// cannot even encode is dropped with a warning rather than failing the task.
fn build_header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                warn!(header = %name, "skipping malformed task header");
            }
        }
    }
    map
}
