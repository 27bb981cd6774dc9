use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;

use crate::error::SyncError;

/// Bearer-authenticated JSON GETs, the only HTTP the REST adapters need.
pub trait JsonTransport: Send + Sync {
    fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: &str,
    ) -> Result<Value, SyncError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Every request is bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("mailsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Provider(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

impl JsonTransport for HttpTransport {
    fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        bearer: &str,
    ) -> Result<Value, SyncError> {
        let mut request = self.client.get(url).bearer_auth(bearer);
        if !query.is_empty() {
            request = request.query(query);
        }
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(response.json::<Value>()?)
    }
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> SyncError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Unauthorized(detail),
        StatusCode::TOO_MANY_REQUESTS => SyncError::ProviderRateLimited(detail),
        StatusCode::NOT_FOUND | StatusCode::GONE => SyncError::NotFound(detail),
        s if s.is_server_error() => SyncError::TransientNetwork(detail),
        StatusCode::REQUEST_TIMEOUT => SyncError::TransientNetwork(detail),
        _ => SyncError::Provider(detail),
    }
}
