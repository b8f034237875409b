//! HTTP client utilities for upstream forwarding
//!
//! Client construction with the gateway's timeout policy, the stream-flag
//! normalization applied to every proxied body, and the mapping from
//! upstream failures onto the error taxonomy. The gateway performs no
//! retries; a failed upstream call surfaces directly.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UNARY_TIMEOUT: Duration = Duration::from_secs(60);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for unary requests: bounded total duration
pub fn unary_client() -> GatewayResult<Client> {
    Client::builder()
        .timeout(UNARY_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {}", e)))
}

/// Client for streaming requests: no total timeout, idle timeout only
pub fn streaming_client() -> GatewayResult<Client> {
    Client::builder()
        .read_timeout(STREAM_IDLE_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| GatewayError::Internal(format!("failed to create HTTP client: {}", e)))
}

/// Coerce the body's `stream` field to a real boolean and report it.
/// This is the only mutation the gateway applies to a client's request body.
pub fn normalize_stream_flag(payload: &mut Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };

    let is_streaming = match obj.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    };

    if obj.contains_key("stream") {
        obj.insert("stream".to_string(), Value::Bool(is_streaming));
    }

    is_streaming
}

/// Map a non-2xx upstream status onto the taxonomy
pub fn map_upstream_status(status: u16, body: &str) -> GatewayError {
    let detail = format!("Upstream returned {}: {}", status, truncate(body, 500));
    match status {
        401 | 403 => GatewayError::UpstreamAuth(detail),
        429 => GatewayError::UpstreamRateLimited(detail),
        400 | 422 => GatewayError::InvalidRequest(detail),
        404 => GatewayError::NotFound(detail),
        408 | 504 => GatewayError::UpstreamTimeout(detail),
        500..=599 => GatewayError::UpstreamUnavailable(detail),
        _ => GatewayError::Internal(detail),
    }
}

/// Map a reqwest transport failure onto the taxonomy
pub fn map_send_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout(format!("Upstream timeout: {}", e))
    } else if e.is_connect() {
        GatewayError::UpstreamUnavailable(format!("Upstream connection failed: {}", e))
    } else {
        GatewayError::UpstreamUnavailable(format!("Upstream request failed: {}", e))
    }
}

/// Parse an SSE `data:` line, tolerating the optional space after the colon
pub fn parse_sse_data(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(rest.strip_prefix(' ').unwrap_or(rest));
    }
    None
}

/// OpenAI-style stream terminator
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

pub fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_stream_flag_variants() {
        let mut payload = json!({"model": "m1", "stream": true});
        assert!(normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], json!(true));

        let mut payload = json!({"model": "m1", "stream": "true"});
        assert!(normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], json!(true));

        let mut payload = json!({"model": "m1", "stream": 0});
        assert!(!normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], json!(false));

        let mut payload = json!({"model": "m1"});
        assert!(!normalize_stream_flag(&mut payload));
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn upstream_status_mapping() {
        assert!(matches!(map_upstream_status(401, ""), GatewayError::UpstreamAuth(_)));
        assert!(matches!(map_upstream_status(429, ""), GatewayError::UpstreamRateLimited(_)));
        assert!(matches!(map_upstream_status(400, ""), GatewayError::InvalidRequest(_)));
        assert!(matches!(map_upstream_status(404, ""), GatewayError::NotFound(_)));
        assert!(matches!(map_upstream_status(503, ""), GatewayError::UpstreamUnavailable(_)));
        assert!(matches!(map_upstream_status(504, ""), GatewayError::UpstreamTimeout(_)));
    }

    #[test]
    fn sse_data_parsing() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert!(is_sse_done("  [DONE]  "));
        assert!(!is_sse_done("{}"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
