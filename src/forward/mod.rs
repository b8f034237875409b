//! Forward module
//!
//! Client-facing endpoints of the gateway. Each endpoint is bound to one
//! upstream driver; per-request orchestration is: auth gate, budget check,
//! body parse, allow-list check, upstream dispatch, then exactly one billing
//! settlement at terminal disposition.
//!
//! ```text
//! Request -> auth gate -> driver -> upstream
//!               |            |
//!               v            v
//!          cache/store   unary: usage from body
//!                        stream: MeteredBody tees SSE + reconstructs usage
//! ```

pub mod client;
pub mod context;
pub mod handlers;
pub mod meter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::auth;
use crate::billing;
use crate::error::{GatewayError, GatewayResult};
use crate::server::AppState;

use context::{BillingContext, EndpointFamily};
use handlers::Driver;
use meter::MeteredBody;

/// OpenAI-compatible chat completions endpoint
///
/// Route: POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, EndpointFamily::OpenAiChat, headers, addr, body).await
}

/// OpenAI-compatible responses endpoint
///
/// Route: POST /v1/responses
pub async fn responses(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, EndpointFamily::OpenAiResponses, headers, addr, body).await
}

/// Anthropic messages endpoint
///
/// Route: POST /v1/messages
pub async fn messages(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    proxy(state, EndpointFamily::AnthropicMessages, headers, addr, body).await
}

async fn proxy(
    state: Arc<AppState>,
    family: EndpointFamily,
    headers: HeaderMap,
    addr: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let started = Instant::now();

    let (key, account) = match auth::authenticate(&state, &headers).await {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };
    let ip = client_ip(&headers, addr.map(|ConnectInfo(a)| a));

    let make_ctx = |model: String, payload: Value| BillingContext {
        key: key.key.clone(),
        user_id: account.user_id.clone(),
        model,
        endpoint: family.client_path(),
        ip: ip.clone(),
        request_payload: payload,
        started,
    };

    // Budget is enforced on the pre-request state; the request that crosses
    // the line is admitted, the next one is rejected.
    if let Err(e) = auth::check_budget(&account) {
        let model = model_name(serde_json::from_slice::<Value>(&body).ok().as_ref());
        billing::log_rejection(state.clone(), make_ctx(model, json!({})), &e).await;
        return e.into_response();
    }

    let mut payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(parse_err) => {
            let e = GatewayError::InvalidRequest(format!("invalid JSON body: {}", parse_err));
            billing::log_rejection(state.clone(), make_ctx("unknown".into(), json!({})), &e).await;
            return e.into_response();
        }
    };

    let model = model_name(Some(&payload));
    if let Some(named) = payload.get("model").and_then(|m| m.as_str()) {
        if let Err(e) = auth::check_model_allowed(&key, named) {
            billing::log_rejection(state.clone(), make_ctx(model, payload.clone()), &e).await;
            return e.into_response();
        }
    }

    let is_streaming = client::normalize_stream_flag(&mut payload);
    let ctx = make_ctx(model.clone(), payload.clone());
    let driver = Driver::for_family(family);

    tracing::info!(
        user_id = %account.user_id,
        model = %model,
        endpoint = family.client_path(),
        streaming = is_streaming,
        "request admitted"
    );

    let result = if is_streaming {
        handle_stream(state.clone(), family, &driver, ctx, &payload).await
    } else {
        handle_unary(state.clone(), family, &driver, ctx, &payload).await
    };

    match result {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle_unary(
    state: Arc<AppState>,
    family: EndpointFamily,
    driver: &Driver,
    ctx: BillingContext,
    payload: &Value,
) -> GatewayResult<Response> {
    let creds = state.settings.credentials(family.provider());
    match handlers::forward_unary(driver, creds, payload).await {
        Ok(outcome) => {
            billing::settle(
                state,
                ctx,
                outcome.usage.clone(),
                outcome.parsed.clone(),
                None,
            )
            .await;
            Ok(Response::builder()
                .status(outcome.status)
                .header("content-type", "application/json")
                .body(Body::from(outcome.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
        Err(e) => {
            billing::log_rejection(state, ctx, &e).await;
            Err(e)
        }
    }
}

async fn handle_stream(
    state: Arc<AppState>,
    family: EndpointFamily,
    driver: &Driver,
    ctx: BillingContext,
    payload: &Value,
) -> GatewayResult<Response> {
    let creds = state.settings.credentials(family.provider());
    match handlers::open_stream(driver, creds, payload).await {
        Ok(upstream) => {
            let metered = MeteredBody::new(upstream.bytes_stream(), family, state, ctx);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .header("connection", "keep-alive")
                .body(Body::from_stream(metered))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
        }
        Err(e) => {
            billing::log_rejection(state, ctx, &e).await;
            Err(e)
        }
    }
}

fn model_name(payload: Option<&Value>) -> String {
    payload
        .and_then(|v| v.get("model"))
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn client_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| addr.map(|a| a.ip().to_string()))
}

/// List models known to the gateway, filtered by the caller's allow-list
///
/// Route: GET /v1/models
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let (key, _account) = match auth::authenticate(&state, &headers).await {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };

    let store = state.store.clone();
    let prices = match tokio::task::spawn_blocking(move || store.list_prices()).await {
        Ok(Ok(prices)) => prices,
        Ok(Err(e)) => return GatewayError::from(e).into_response(),
        Err(e) => return GatewayError::Internal(format!("store task failed: {}", e)).into_response(),
    };

    let models: Vec<Value> = prices
        .iter()
        .filter(|p| key.allows_model(&p.model_name))
        .map(|p| {
            json!({
                "id": p.model_name,
                "object": "model",
                "created": p.updated_at,
                "owned_by": p.provider,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": models })).into_response()
}

/// The caller's account snapshot
///
/// Route: GET /v1/account
pub async fn account_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let (_key, account) = match auth::authenticate(&state, &headers).await {
        Ok(pair) => pair,
        Err(e) => return e.into_response(),
    };

    Json(json!({
        "user_id": account.user_id,
        "account_name": account.account_name,
        "budget_usd": account.budget_usd,
        "spent_usd": account.spent_usd,
        "remaining_usd": account.remaining_usd(),
        "over_budget": account.over_budget(),
        "budget_period": account.budget_period,
        "is_active": account.is_active,
        "created_at": account.created_at,
        "updated_at": account.updated_at,
    }))
    .into_response()
}
