//! OpenAI Chat Completions driver
//!
//! Forwards `/v1/chat/completions` bodies to an OpenAI-compatible upstream
//! and reads the `usage` object out of unary responses.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::config::ProviderCredentials;
use crate::error::{GatewayError, GatewayResult};
use crate::forward::context::{EndpointFamily, Usage};

use super::ProviderDriver;

pub struct OpenAiChatDriver;

impl ProviderDriver for OpenAiChatDriver {
    fn family(&self) -> EndpointFamily {
        EndpointFamily::OpenAiChat
    }

    fn name(&self) -> &'static str {
        "openai_chat"
    }

    fn upstream_path(&self) -> &'static str {
        "/v1/chat/completions"
    }

    fn build_headers(&self, creds: &ProviderCredentials) -> GatewayResult<HeaderMap> {
        bearer_headers(creds, "openai")
    }

    fn extract_usage(&self, response: &Value) -> Usage {
        extract_chat_usage(response)
    }
}

/// `Authorization: Bearer` header set shared by both OpenAI families
pub(super) fn bearer_headers(
    creds: &ProviderCredentials,
    provider: &str,
) -> GatewayResult<HeaderMap> {
    let api_key = creds.api_key.as_deref().ok_or_else(|| {
        GatewayError::UpstreamAuth(format!("No API key configured for provider '{}'", provider))
    })?;

    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|_| GatewayError::Internal("provider API key contains invalid characters".to_string()))?;
    headers.insert("authorization", value);
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    Ok(headers)
}

pub(super) fn extract_chat_usage(response: &Value) -> Usage {
    let mut usage = Usage::default();
    let Some(block) = response.get("usage").filter(|u| u.is_object()) else {
        return usage;
    };
    usage.input_tokens = block.get("prompt_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
    usage.output_tokens = block
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.cache_read_tokens = block
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage
}
