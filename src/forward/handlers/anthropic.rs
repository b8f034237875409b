//! Anthropic Messages driver
//!
//! Forwards `/v1/messages` bodies with the `x-api-key` / `anthropic-version`
//! header pair and maps the four-field Anthropic usage object onto the
//! common shape.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::config::ProviderCredentials;
use crate::error::{GatewayError, GatewayResult};
use crate::forward::context::{EndpointFamily, Usage};

use super::ProviderDriver;

/// Anthropic API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicMessagesDriver;

impl ProviderDriver for AnthropicMessagesDriver {
    fn family(&self) -> EndpointFamily {
        EndpointFamily::AnthropicMessages
    }

    fn name(&self) -> &'static str {
        "anthropic_messages"
    }

    fn upstream_path(&self) -> &'static str {
        "/v1/messages"
    }

    fn build_headers(&self, creds: &ProviderCredentials) -> GatewayResult<HeaderMap> {
        let api_key = creds.api_key.as_deref().ok_or_else(|| {
            GatewayError::UpstreamAuth("No API key configured for provider 'anthropic'".to_string())
        })?;

        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(api_key).map_err(|_| {
            GatewayError::Internal("provider API key contains invalid characters".to_string())
        })?;
        headers.insert("x-api-key", value);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn extract_usage(&self, response: &Value) -> Usage {
        let mut usage = Usage::default();
        let Some(block) = response.get("usage").filter(|u| u.is_object()) else {
            return usage;
        };
        usage.input_tokens = block.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        usage.output_tokens = block.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        usage.cache_read_tokens = block
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        usage.cache_write_tokens = block
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        usage
    }
}
