//! Forward context structures
//!
//! Shared types passed between the ingress handlers, the drivers, and the
//! billing ledger.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported upstream providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAI,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Client-facing endpoint families. The endpoint determines the upstream;
/// the model name never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointFamily {
    OpenAiChat,
    OpenAiResponses,
    AnthropicMessages,
}

impl EndpointFamily {
    pub fn provider(self) -> Provider {
        match self {
            EndpointFamily::OpenAiChat | EndpointFamily::OpenAiResponses => Provider::OpenAI,
            EndpointFamily::AnthropicMessages => Provider::Anthropic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EndpointFamily::OpenAiChat => "openai_chat",
            EndpointFamily::OpenAiResponses => "openai_responses",
            EndpointFamily::AnthropicMessages => "anthropic_messages",
        }
    }

    /// The client-facing route, recorded in usage logs as `endpoint`
    pub fn client_path(self) -> &'static str {
        match self {
            EndpointFamily::OpenAiChat => "/v1/chat/completions",
            EndpointFamily::OpenAiResponses => "/v1/responses",
            EndpointFamily::AnthropicMessages => "/v1/messages",
        }
    }
}

/// Token usage attributable to a single completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    /// True when the counts came from the word-count estimator rather than
    /// an upstream usage block.
    pub estimated: bool,
}

impl Usage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_cache_hit(&self) -> bool {
        self.cache_read_tokens > 0
    }
}

/// Everything the billing ledger needs at terminal disposition
#[derive(Debug, Clone)]
pub struct BillingContext {
    pub key: String,
    pub user_id: String,
    pub model: String,
    pub endpoint: &'static str,
    pub ip: Option<String>,
    pub request_payload: Value,
    pub started: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_routing_is_fixed() {
        assert_eq!(EndpointFamily::OpenAiChat.provider(), Provider::OpenAI);
        assert_eq!(EndpointFamily::OpenAiResponses.provider(), Provider::OpenAI);
        assert_eq!(EndpointFamily::AnthropicMessages.provider(), Provider::Anthropic);
    }

    #[test]
    fn usage_total_and_cache_hit() {
        let usage = Usage {
            input_tokens: 5,
            output_tokens: 7,
            cache_read_tokens: 2,
            ..Default::default()
        };
        assert_eq!(usage.total(), 12);
        assert!(usage.is_cache_hit());
        assert!(!Usage::default().is_cache_hit());
    }
}
