//! Shared HTTP plumbing for the upstream adapters.

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use crate::error::{CoreError, FetchError, Result};
use crate::id::SourceType;

/// Client used for upstream polling and fire-and-forget delivery.
pub fn herald_reqwest_client(user_agent: Option<&str>) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(user_agent.unwrap_or(concat!("herald/", env!("CARGO_PKG_VERSION"))))
        .timeout(Duration::from_secs(20))
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|cause| CoreError::HttpClient { cause })
}

pub(crate) fn request_failed(source_type: SourceType, err: reqwest::Error) -> FetchError {
    FetchError::unavailable(source_type, err.to_string())
}

/// Reads a JSON body, mapping transport-level failures onto [`FetchError`].
pub(crate) async fn read_json(source_type: SourceType, response: reqwest::Response) -> std::result::Result<Value, FetchError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::UpstreamAuthExpired { source_type });
    }
    if !status.is_success() {
        return Err(FetchError::unavailable(source_type, format!("HTTP {}", status)));
    }
    let body = response
        .text()
        .await
        .map_err(|e| request_failed(source_type, e))?;
    serde_json::from_str(&body).map_err(|e| FetchError::malformed(source_type, e.to_string()))
}

/// A field that upstream may send as either a string or a number.
pub(crate) fn text_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn int_at(value: &Value, pointer: &str) -> Option<i64> {
    match value.pointer(pointer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loose_field_access() {
        let value = json!({"a": {"id": 12, "sid": "34", "name": "x", "none": null}});
        assert_eq!(text_at(&value, "/a/id").as_deref(), Some("12"));
        assert_eq!(int_at(&value, "/a/sid"), Some(34));
        assert_eq!(text_at(&value, "/a/name").as_deref(), Some("x"));
        assert_eq!(text_at(&value, "/a/none"), None);
        assert_eq!(int_at(&value, "/a/missing"), None);
    }
}
