//! Plumbing shared by the HTTP-based vendor adapters.

use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::engine::AdapterError;

/// Resolve a credential from a literal value or the named environment variable.
///
/// A missing credential is not an error here: the adapter still registers and
/// reports itself unavailable on every call, so the gap shows up in poll reports.
pub fn credential(literal: Option<&str>, env_var: Option<&str>) -> Option<String> {
    if let Some(value) = literal {
        return Some(value.to_string());
    }
    let name = env_var?;
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => {
            debug!("Environment variable {} is not set", name);
            None
        }
    }
}

pub fn client(timeout: Duration, accept_invalid_certs: bool) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .context("Failed to build HTTP client")
}

/// Send a request and decode a JSON body, mapping every failure to an adapter error.
///
/// Transport failures and non-success statuses are `Unavailable`; a body that
/// does not decode is `DataInvalid`.
pub async fn send_json<T: DeserializeOwned>(
    vendor: &str,
    request: reqwest::RequestBuilder,
) -> Result<T, AdapterError> {
    let response = send(vendor, request).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| AdapterError::data_invalid(vendor, format!("unexpected response body: {}", e)))
}

/// Send a request, discarding the body on success.
pub async fn send(
    vendor: &str,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, AdapterError> {
    let response = request
        .send()
        .await
        .map_err(|e| AdapterError::unavailable(vendor, e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let reason = match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            format!("credentials rejected (HTTP {})", status.as_u16())
        }
        reqwest::StatusCode::TOO_MANY_REQUESTS => "rate limited (HTTP 429)".to_string(),
        _ => format!("HTTP {}", status.as_u16()),
    };
    Err(AdapterError::unavailable(vendor, reason))
}
