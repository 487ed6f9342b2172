use axum::body::Bytes;
use serde_json::json;
use sonde_model::ExpectedResult;

/// MIME type of monitor-synthesized failure bodies.
pub const FAILURE_MIME_TYPE: &str = "application/json";

/// A result handed to the aggregator without going over the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct PluginResult {
    pub key: ExpectedResult,
    pub body: Bytes,
    pub mime_type: String,
    /// Set when the result reports a failure instead of plugin output.
    pub error: Option<String>,
}

impl PluginResult {
    /// Failure result for `key`, recording the reason and the offending
    /// unit in a small JSON document.
    pub fn failure(
        key: ExpectedResult,
        reason: impl Into<String>,
        unit: Option<&str>,
    ) -> Self {
        let reason = reason.into();
        let body = json!({ "error": reason, "unit": unit });

        Self {
            key,
            body: Bytes::from(body.to_string()),
            mime_type: FAILURE_MIME_TYPE.to_string(),
            error: Some(reason),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
