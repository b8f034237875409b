//! Authentication and authorization gate
//!
//! Resolves `Authorization: Bearer <key>` into a (key, account) pair via the
//! coherent cache and enforces active state, budget, and the key's model
//! allow-list. The admin surface has its own gate keyed on the static admin
//! secret.

use axum::http::HeaderMap;

use crate::config::Settings;
use crate::db::{Account, ApiKey};
use crate::error::{GatewayError, GatewayResult};
use crate::server::AppState;

/// Extract and trim a bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Resolve the caller to an active (key, account) pair.
///
/// Budget is not checked here; the proxy endpoints call [`check_budget`]
/// after this resolves, while the informational endpoints skip it.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> GatewayResult<(ApiKey, Account)> {
    let token = bearer_token(headers)
        .ok_or_else(|| GatewayError::Unauthorized("Missing API key".to_string()))?;

    let key = state
        .cache
        .api_key(&token)
        .await?
        .ok_or_else(|| GatewayError::Unauthorized("Invalid API key".to_string()))?;

    if !key.is_active {
        return Err(GatewayError::Forbidden("API key is disabled".to_string()));
    }

    let account = state.cache.account(&key.user_id).await?.ok_or_else(|| {
        // A key that points at no account is a data integrity problem,
        // not an authentication failure.
        GatewayError::Internal(format!(
            "key references unknown account '{}'",
            key.user_id
        ))
    })?;

    if !account.is_active {
        return Err(GatewayError::Forbidden("Account is disabled".to_string()));
    }

    Ok((key, account))
}

pub fn check_budget(account: &Account) -> GatewayResult<()> {
    if account.over_budget() {
        return Err(GatewayError::BudgetExceeded(format!(
            "Account budget exceeded: spent ${:.6} of ${:.6}",
            account.spent_usd, account.budget_usd
        )));
    }
    Ok(())
}

pub fn check_model_allowed(key: &ApiKey, model: &str) -> GatewayResult<()> {
    if !key.allows_model(model) {
        return Err(GatewayError::Forbidden(format!(
            "Model '{}' not allowed for this API key",
            model
        )));
    }
    Ok(())
}

/// Admin gate: exact match against the configured admin secret
pub fn authenticate_admin(settings: &Settings, headers: &HeaderMap) -> GatewayResult<()> {
    let token = bearer_token(headers)
        .ok_or_else(|| GatewayError::Unauthorized("Missing admin key".to_string()))?;
    if token != settings.admin_key {
        return Err(GatewayError::Unauthorized("Invalid admin key".to_string()));
    }
    Ok(())
}
