//! HTTP adapter for the external text transform.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use pairchat_core::{TextTransform, TransformError};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct TransformRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct TransformResponse {
    text: String,
}

/// Posts `{"text": ...}` to a remote service and reads `{"text": ...}` back.
pub struct HttpTransform {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpTransform {
    /// Create a transform calling `url`, authenticating with `api_key` as a
    /// bearer token when present.
    ///
    /// `timeout` bounds each HTTP call. The relay applies its own bound on
    /// top.
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransformError::Service(e.to_string()))?;
        Ok(Self { client, url: url.into(), api_key })
    }
}

impl fmt::Debug for HttpTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransform")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl TextTransform for HttpTransform {
    async fn transform(&self, text: &str) -> Result<String, TransformError> {
        let mut request = self.client.post(&self.url).json(&TransformRequest { text });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| TransformError::Service(e.to_string()))?;

        let body: TransformResponse =
            response.json().await.map_err(|e| TransformError::Malformed(e.to_string()))?;
        Ok(body.text)
    }
}
