//! Provider drivers
//!
//! One driver per upstream endpoint family, modeled as a fixed closed set.
//! A driver contributes the upstream path, the provider's auth headers, and
//! usage extraction from a unary response body; the shared forwarding
//! plumbing lives here. Drivers never reshape payloads across provider
//! families: clients get back exactly the wire shape the upstream produced.

pub mod anthropic;
pub mod openai;
pub mod responses;

use axum::body::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::ProviderCredentials;
use crate::error::{GatewayError, GatewayResult};
use crate::forward::client;
use crate::forward::context::{EndpointFamily, Usage};

/// Per-family driver behavior
pub trait ProviderDriver {
    fn family(&self) -> EndpointFamily;

    fn name(&self) -> &'static str;

    /// Path appended to the provider's base URL
    fn upstream_path(&self) -> &'static str;

    /// Upstream-mandated headers. Fails when the provider has no API key
    /// configured; nothing has been sent upstream at that point.
    fn build_headers(&self, creds: &ProviderCredentials) -> GatewayResult<HeaderMap>;

    /// Translate the provider's usage object into the common shape
    fn extract_usage(&self, response: &Value) -> Usage;
}

/// The fixed driver set, dispatched by endpoint family
pub enum Driver {
    OpenAiChat(openai::OpenAiChatDriver),
    OpenAiResponses(responses::OpenAiResponsesDriver),
    AnthropicMessages(anthropic::AnthropicMessagesDriver),
}

impl Driver {
    pub fn for_family(family: EndpointFamily) -> Driver {
        match family {
            EndpointFamily::OpenAiChat => Driver::OpenAiChat(openai::OpenAiChatDriver),
            EndpointFamily::OpenAiResponses => {
                Driver::OpenAiResponses(responses::OpenAiResponsesDriver)
            }
            EndpointFamily::AnthropicMessages => {
                Driver::AnthropicMessages(anthropic::AnthropicMessagesDriver)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Driver::OpenAiChat(d) => d.name(),
            Driver::OpenAiResponses(d) => d.name(),
            Driver::AnthropicMessages(d) => d.name(),
        }
    }

    pub fn upstream_path(&self) -> &'static str {
        match self {
            Driver::OpenAiChat(d) => d.upstream_path(),
            Driver::OpenAiResponses(d) => d.upstream_path(),
            Driver::AnthropicMessages(d) => d.upstream_path(),
        }
    }

    pub fn build_headers(&self, creds: &ProviderCredentials) -> GatewayResult<HeaderMap> {
        match self {
            Driver::OpenAiChat(d) => d.build_headers(creds),
            Driver::OpenAiResponses(d) => d.build_headers(creds),
            Driver::AnthropicMessages(d) => d.build_headers(creds),
        }
    }

    pub fn extract_usage(&self, response: &Value) -> Usage {
        match self {
            Driver::OpenAiChat(d) => d.extract_usage(response),
            Driver::OpenAiResponses(d) => d.extract_usage(response),
            Driver::AnthropicMessages(d) => d.extract_usage(response),
        }
    }

    fn upstream_url(&self, creds: &ProviderCredentials) -> String {
        format!(
            "{}{}",
            creds.base_url.trim_end_matches('/'),
            self.upstream_path()
        )
    }
}

/// Outcome of a unary upstream call. `body` is the raw upstream bytes,
/// returned to the client unmodified; `parsed` is the same body decoded for
/// usage extraction and the response snapshot.
pub struct UnaryOutcome {
    pub status: u16,
    pub body: Bytes,
    pub parsed: Value,
    pub usage: Usage,
}

/// Forward a unary request and extract usage from the response
pub async fn forward_unary(
    driver: &Driver,
    creds: &ProviderCredentials,
    payload: &Value,
) -> GatewayResult<UnaryOutcome> {
    let headers = driver.build_headers(creds)?;
    let url = driver.upstream_url(creds);
    let http = client::unary_client()?;

    tracing::debug!(driver = driver.name(), url = %url, "forwarding unary request");

    let response = http
        .post(&url)
        .headers(headers)
        .json(payload)
        .send()
        .await
        .map_err(client::map_send_error)?;

    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::UpstreamUnavailable(format!("failed to read upstream response: {}", e)))?;

    if !status.is_success() {
        let snippet = String::from_utf8_lossy(&body);
        return Err(client::map_upstream_status(status.as_u16(), &snippet));
    }

    let parsed: Value = serde_json::from_slice(&body).map_err(|e| {
        GatewayError::Internal(format!("upstream returned malformed JSON: {}", e))
    })?;
    let usage = driver.extract_usage(&parsed);

    Ok(UnaryOutcome {
        status: status.as_u16(),
        body,
        parsed,
        usage,
    })
}

/// Open a streaming upstream call and hand back the response for metering.
/// Upstream rejection before any SSE bytes surfaces as a taxonomy error.
pub async fn open_stream(
    driver: &Driver,
    creds: &ProviderCredentials,
    payload: &Value,
) -> GatewayResult<reqwest::Response> {
    let headers = driver.build_headers(creds)?;
    let url = driver.upstream_url(creds);
    let http = client::streaming_client()?;

    tracing::debug!(driver = driver.name(), url = %url, "opening upstream stream");

    let response = http
        .post(&url)
        .headers(headers)
        .json(payload)
        .send()
        .await
        .map_err(client::map_send_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(client::map_upstream_status(status.as_u16(), &body));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_fixed_by_family() {
        assert_eq!(Driver::for_family(EndpointFamily::OpenAiChat).name(), "openai_chat");
        assert_eq!(
            Driver::for_family(EndpointFamily::OpenAiResponses).name(),
            "openai_responses"
        );
        assert_eq!(
            Driver::for_family(EndpointFamily::AnthropicMessages).name(),
            "anthropic_messages"
        );
    }

    #[test]
    fn upstream_url_joins_base_and_path() {
        let creds = ProviderCredentials {
            api_key: Some("sk-test".into()),
            base_url: "https://api.openai.com/".into(),
        };
        let driver = Driver::for_family(EndpointFamily::OpenAiChat);
        assert_eq!(driver.upstream_url(&creds), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn missing_api_key_is_an_auth_error() {
        let creds = ProviderCredentials { api_key: None, base_url: "https://x".into() };
        for family in [
            EndpointFamily::OpenAiChat,
            EndpointFamily::OpenAiResponses,
            EndpointFamily::AnthropicMessages,
        ] {
            let driver = Driver::for_family(family);
            assert!(matches!(
                driver.build_headers(&creds),
                Err(GatewayError::UpstreamAuth(_))
            ));
        }
    }
}
