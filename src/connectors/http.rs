//! Shared blocking HTTP plumbing for the REST-backed connectors

use crate::error::{Result, SyncError};
use reqwest::blocking::{Client, Response};
use reqwest::Url;
use std::time::Duration;

pub fn client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .map_err(SyncError::Http)
}

/// Pass a successful response through, otherwise turn the status and body into a `Backend` error.
pub fn ensure_success(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(SyncError::Backend(format!(
        "{} failed with HTTP {}: {}",
        context,
        status,
        body.trim()
    )))
}

/// `base` with each of `segments` appended as a percent-encoded path segment.
pub fn url_with_segments(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| SyncError::Config(format!("Invalid endpoint '{}': {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Config(format!("Endpoint '{}' cannot take a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
