//! Outbound call executor port.
//!
//! `external` and `webhook` steps describe a request; the engine decides
//! *when* to call and *what to do with the result*. How the HTTP call is made
//! belongs to the infrastructure layer behind this trait.

use std::collections::HashMap;

use serde_json::Value;

use crate::expression::resolve_template;

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A fully-resolved outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    /// Body after template interpolation, when one was configured.
    pub body: Option<String>,
}

impl OutboundRequest {
    /// Build a request from step configuration, interpolating `{{ path }}`
    /// markers in the url, header values, and body against `context`.
    pub fn from_config(
        url: &str,
        method: &str,
        headers: Option<&HashMap<String, String>>,
        body: Option<&str>,
        context: &Value,
    ) -> Self {
        let headers = headers
            .map(|h| {
                h.iter()
                    .map(|(k, v)| (k.clone(), resolve_template(v, context)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            url: resolve_template(url, context),
            method: method.to_string(),
            headers,
            body: body.map(|b| resolve_template(b, context)),
        }
    }
}

/// Result of a performed outbound call.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    /// Response body, parsed as JSON when possible, otherwise a string.
    pub body: Value,
}

impl OutboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from performing an outbound call.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("target responded with status {status}")]
    Status { status: u16, body: String },
}

// ---------------------------------------------------------------------------
// OutboundExecutor trait
// ---------------------------------------------------------------------------

/// Capability to perform an outbound HTTP call (consumed, not implemented
/// here).
pub trait OutboundExecutor: Send + Sync {
    /// Perform the call and report the response or a delivery error.
    fn execute(
        &self,
        request: OutboundRequest,
    ) -> impl std::future::Future<Output = Result<OutboundResponse, OutboundError>> + Send;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_config_interpolates_url_headers_and_body() {
        let ctx = json!({
            "steps": {"lookup": {"output": {"id": "42"}}},
            "input": {"tenant": "acme"}
        });
        let headers = HashMap::from([("X-Tenant".to_string(), "{{ input.tenant }}".to_string())]);
        let req = OutboundRequest::from_config(
            "https://crm.example.com/contacts/{{ steps.lookup.output.id }}",
            "PUT",
            Some(&headers),
            Some(r#"{"contact": {{ steps.lookup.output }}}"#),
            &ctx,
        );
        assert_eq!(req.url, "https://crm.example.com/contacts/42");
        assert_eq!(req.method, "PUT");
        assert_eq!(req.headers.get("X-Tenant").unwrap(), "acme");
        assert_eq!(req.body.as_deref(), Some(r#"{"contact": {"id":"42"}}"#));
    }

    #[test]
    fn response_success_range() {
        let ok = OutboundResponse {
            status: 204,
            body: Value::Null,
        };
        assert!(ok.is_success());
        let bad = OutboundResponse {
            status: 502,
            body: Value::Null,
        };
        assert!(!bad.is_success());
    }
}
