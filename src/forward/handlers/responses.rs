//! OpenAI Responses driver
//!
//! Same upstream and auth as the chat driver, different path and usage
//! field names (`input_tokens` / `output_tokens`).

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::ProviderCredentials;
use crate::error::GatewayResult;
use crate::forward::context::{EndpointFamily, Usage};

use super::openai::bearer_headers;
use super::ProviderDriver;

pub struct OpenAiResponsesDriver;

impl ProviderDriver for OpenAiResponsesDriver {
    fn family(&self) -> EndpointFamily {
        EndpointFamily::OpenAiResponses
    }

    fn name(&self) -> &'static str {
        "openai_responses"
    }

    fn upstream_path(&self) -> &'static str {
        "/v1/responses"
    }

    fn build_headers(&self, creds: &ProviderCredentials) -> GatewayResult<HeaderMap> {
        bearer_headers(creds, "openai")
    }

    fn extract_usage(&self, response: &Value) -> Usage {
        let mut usage = Usage::default();
        let Some(block) = response.get("usage").filter(|u| u.is_object()) else {
            return usage;
        };
        usage.input_tokens = block.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        usage.output_tokens = block.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        usage.cache_read_tokens = block
            .get("input_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_input_and_output_tokens() {
        let response = json!({
            "id": "resp_1",
            "usage": {
                "input_tokens": 20,
                "output_tokens": 8,
                "input_tokens_details": {"cached_tokens": 12}
            }
        });
        let usage = OpenAiResponsesDriver.extract_usage(&response);
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 8);
        assert_eq!(usage.cache_read_tokens, 12);
    }

    #[test]
    fn missing_usage_is_zero() {
        assert_eq!(OpenAiResponsesDriver.extract_usage(&json!({})), Usage::default());
    }
}
