//! Billing ledger
//!
//! Runs exactly once per request at terminal disposition: price the usage,
//! issue the conditional debit, publish the account invalidation, and append
//! the immutable usage log. The debit and the log append are independent
//! operations; if one succeeds and the other fails the divergence is logged
//! at error level so it can be audited.

use std::sync::Arc;

use serde_json::Value;

use crate::db::NewUsageLog;
use crate::error::GatewayError;
use crate::forward::context::{BillingContext, Usage};
use crate::pricing;
use crate::server::AppState;

/// Settle a request. `error_message` is set for failed requests and for
/// partial streams (upstream error or client disconnect); usage carries
/// whatever was reconstructed up to that point and prices normally, so a
/// failed unary request (zero usage) bills zero.
pub async fn settle(
    state: Arc<AppState>,
    ctx: BillingContext,
    usage: Usage,
    response_snapshot: Value,
    error_message: Option<String>,
) {
    let processing_ms = ctx.started.elapsed().as_millis() as i64;

    let cost_usd = match state.cache.price(&ctx.model).await {
        Ok(Some(price)) => pricing::cost_usd(&usage, &price),
        Ok(None) => {
            if usage.total() > 0 {
                tracing::warn!(model = %ctx.model, "no price configured for model, billing zero");
            }
            0.0
        }
        Err(e) => {
            tracing::error!(model = %ctx.model, error = %e, "price lookup failed, billing zero");
            0.0
        }
    };

    let mut debited = false;
    if cost_usd > 0.0 {
        let store = state.store.clone();
        let user_id = ctx.user_id.clone();
        match tokio::task::spawn_blocking(move || store.atomic_debit(&user_id, cost_usd)).await {
            Ok(Ok(true)) => {
                debited = true;
                state
                    .cache
                    .invalidate(crate::cache::Namespace::Account, &ctx.user_id)
                    .await;
            }
            Ok(Ok(false)) => {
                // Account was deactivated (or deleted) mid-request; the
                // usage log below still records what happened.
                tracing::warn!(
                    user_id = %ctx.user_id,
                    cost_usd,
                    "debit matched no active account, usage logged without charge"
                );
            }
            Ok(Err(e)) => {
                tracing::error!(
                    user_id = %ctx.user_id,
                    cost_usd,
                    error = %e,
                    "debit failed, ledger may under-charge"
                );
            }
            Err(e) => {
                tracing::error!(user_id = %ctx.user_id, error = %e, "debit task failed");
            }
        }
    }

    let log = NewUsageLog {
        user_id: ctx.user_id.clone(),
        key: ctx.key.clone(),
        model: ctx.model.clone(),
        endpoint: ctx.endpoint.to_string(),
        ip: ctx.ip.clone(),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_tokens,
        cache_write_tokens: usage.cache_write_tokens,
        total_tokens: usage.total(),
        cost_usd: if debited { cost_usd } else { 0.0 },
        is_cache_hit: usage.is_cache_hit(),
        is_estimated: usage.estimated,
        processing_ms,
        error_message: error_message.clone(),
        request_payload: ctx.request_payload.clone(),
        response_payload: response_snapshot,
    };

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.append_usage(&log)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            if debited {
                tracing::error!(
                    user_id = %ctx.user_id,
                    cost_usd,
                    error = %e,
                    "usage log append failed after successful debit, ledger over-charges silently"
                );
            } else {
                tracing::error!(user_id = %ctx.user_id, error = %e, "usage log append failed");
            }
        }
        Err(e) => {
            tracing::error!(user_id = %ctx.user_id, error = %e, "usage log task failed");
        }
    }

    tracing::info!(
        user_id = %ctx.user_id,
        model = %ctx.model,
        endpoint = ctx.endpoint,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cost_usd = if debited { cost_usd } else { 0.0 },
        estimated = usage.estimated,
        processing_ms,
        error = error_message.as_deref().unwrap_or(""),
        "request settled"
    );
}

/// Record a gate rejection for an identified key. Never debits.
pub async fn log_rejection(
    state: Arc<AppState>,
    ctx: BillingContext,
    error: &GatewayError,
) {
    settle(
        state,
        ctx,
        Usage::default(),
        serde_json::json!({ "error": { "type": error.kind(), "message": error.message() } }),
        Some(error.to_string()),
    )
    .await;
}
