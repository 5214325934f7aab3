//! reqwest-backed outbound call executor.

use std::time::Duration;

use weft_core::outbound::{OutboundError, OutboundExecutor, OutboundRequest, OutboundResponse};

/// Default per-call timeout (30 seconds).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs `external`/`webhook` step calls over HTTP.
#[derive(Clone)]
pub struct HttpOutboundExecutor {
    client: reqwest::Client,
}

impl HttpOutboundExecutor {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpOutboundExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundExecutor for HttpOutboundExecutor {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse, OutboundError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| OutboundError::Request(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OutboundError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| OutboundError::Request(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        tracing::debug!(url = request.url.as_str(), status, "outbound call completed");
        Ok(OutboundResponse { status, body })
    }
}
