use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use tracing::debug;

use crate::error::ApiErrorKind;
use crate::{Error, Result};

/// Response header set by the service when a file was flagged by its
/// malware scanner.
pub const MALWARE_HEADER: &str = "x-virus-infected";

#[derive(Debug, Clone)]
pub struct HttpContentConfig {
    pub timeout: Duration,
    pub bearer_token: Option<String>,
}

impl Default for HttpContentConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            bearer_token: None,
        }
    }
}

/// Fetches item bytes from pre-authenticated download urls.
#[derive(Debug, Clone)]
pub struct HttpContentClient {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpContentClient {
    pub fn new(config: HttpContentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client build failed: {e}"),
            })?;
        Ok(Self {
            client,
            bearer_token: config.bearer_token,
        })
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let res = req
            .send()
            .await
            .map_err(|e| Error::api(ApiErrorKind::Generic, format!("download request failed: {e}")))?;

        let status = res.status();
        if let Some(kind) = classify_response(status, res.headers()) {
            let body = res.text().await.unwrap_or_default();
            debug!(
                event = "http.download.failed",
                status = status.as_u16(),
                kind = %kind,
                "http.download.failed"
            );
            return Err(Error::api(kind, format!("download http {status}: {body}")));
        }

        let bytes = res
            .bytes()
            .await
            .map_err(|e| Error::api(ApiErrorKind::Generic, format!("download read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Maps a download response to the failure class it represents, if any.
pub fn classify_response(status: StatusCode, headers: &HeaderMap) -> Option<ApiErrorKind> {
    if headers.contains_key(MALWARE_HEADER) {
        return Some(ApiErrorKind::Malware);
    }
    if status.is_success() {
        return None;
    }
    Some(classify_status(status))
}

fn classify_status(status: StatusCode) -> ApiErrorKind {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorKind::Unauthorized
    } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
        ApiErrorKind::NotFound
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorKind::RateLimited
    } else if status == StatusCode::SERVICE_UNAVAILABLE {
        ApiErrorKind::ServiceUnavailable
    } else {
        ApiErrorKind::Generic
    }
}
