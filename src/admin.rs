//! Admin surface
//!
//! CRUD over accounts, keys, and model prices, plus the per-tenant usage
//! summary. Protected by the static admin secret. Every mutation publishes
//! its cache-invalidation tuple so other replicas converge before TTL
//! expiry.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::Deserialize;
use serde_json::json;
use tower_http::timeout::TimeoutLayer;

use crate::auth;
use crate::cache::Namespace;
use crate::db::{
    now_ts, AccountCreate, AccountPatch, ApiKey, KeyPatch, PriceUpsert, Store,
};
use crate::error::{GatewayError, GatewayResult};
use crate::server::AppState;

/// Length of the random part of a generated key
const KEY_RANDOM_LEN: usize = 32;

/// Admin operations are all local store work and should return fast
const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/accounts", post(create_account).get(list_accounts))
        .route(
            "/admin/accounts/:user_id",
            get(get_account).patch(update_account),
        )
        .route("/admin/keys", post(create_key))
        .route("/admin/keys/bulk", post(create_keys_bulk))
        .route("/admin/keys/:id", get(list_user_keys).patch(update_key))
        .route("/admin/costs", post(upsert_cost).get(list_costs))
        .route("/admin/costs/:model", get(get_cost).delete(delete_cost))
        .route("/admin/usage/:user_id", get(usage_summary))
        .route("/admin/providers", get(provider_configuration))
        .layer(TimeoutLayer::new(ADMIN_TIMEOUT))
}

/// Run a store operation off the async executor, like the cache loaders do
async fn with_store<T, F>(store: &Store, op: F) -> GatewayResult<T>
where
    T: Send + 'static,
    F: FnOnce(Store) -> GatewayResult<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store))
        .await
        .map_err(|e| GatewayError::Internal(format!("store task failed: {}", e)))?
}

/// Generate a fresh bearer key: `gw-` + 32 random alphanumerics
pub fn generate_key() -> String {
    let random: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("gw-{}", random)
}

// ----------------------------------------------------------------------
// Accounts
// ----------------------------------------------------------------------

async fn create_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<AccountCreate>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        if input.user_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("user_id must not be empty".into()));
        }
        if input.budget_usd < 0.0 {
            return Err(GatewayError::InvalidRequest("budget_usd must be >= 0".into()));
        }
        let user_id = input.user_id.clone();
        let account = with_store(&state.store, move |store| Ok(store.create_account(&input)?))
            .await?
            .ok_or_else(|| {
                GatewayError::InvalidRequest(format!("Account '{}' already exists", user_id))
            })?;
        Ok(Json(account).into_response())
    })
    .await
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let limit = page.limit.unwrap_or(100);
        let offset = page.offset.unwrap_or(0);
        let accounts =
            with_store(&state.store, move |store| Ok(store.list_accounts(limit, offset)?)).await?;
        Ok(Json(accounts).into_response())
    })
    .await
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let account = with_store(&state.store, move |store| Ok(store.account(&user_id)?))
            .await?
            .ok_or_else(|| GatewayError::NotFound("Account not found".into()))?;
        Ok(Json(account).into_response())
    })
    .await
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(patch): Json<AccountPatch>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        if matches!(patch.budget_usd, Some(b) if b < 0.0) {
            return Err(GatewayError::InvalidRequest("budget_usd must be >= 0".into()));
        }
        let lookup = user_id.clone();
        let account =
            with_store(&state.store, move |store| Ok(store.update_account(&lookup, &patch)?))
                .await?
                .ok_or_else(|| GatewayError::NotFound("Account not found".into()))?;
        state.cache.invalidate(Namespace::Account, &user_id).await;
        Ok(Json(account).into_response())
    })
    .await
}

// ----------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct KeyCreate {
    user_id: String,
    #[serde(default)]
    key_name: Option<String>,
    #[serde(default)]
    allowed_models: Vec<String>,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_true() -> bool {
    true
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<KeyCreate>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let record = with_store(&state.store, move |store| mint_key(&store, &input)).await?;
        Ok(Json(record).into_response())
    })
    .await
}

#[derive(Deserialize)]
struct BulkKeyCreate {
    user_id: String,
    count: u32,
    #[serde(default = "default_key_prefix")]
    key_prefix: String,
    #[serde(default)]
    allowed_models: Vec<String>,
    #[serde(default = "default_true")]
    is_active: bool,
}

fn default_key_prefix() -> String {
    "key".to_string()
}

async fn create_keys_bulk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<BulkKeyCreate>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        if input.count == 0 || input.count > 100 {
            return Err(GatewayError::InvalidRequest(
                "count must be between 1 and 100".into(),
            ));
        }
        // One offload for the whole batch rather than one per key
        let created = with_store(&state.store, move |store| {
            let mut created = Vec::with_capacity(input.count as usize);
            for i in 0..input.count {
                created.push(mint_key(
                    &store,
                    &KeyCreate {
                        user_id: input.user_id.clone(),
                        key_name: Some(format!("{}-{}", input.key_prefix, i + 1)),
                        allowed_models: input.allowed_models.clone(),
                        is_active: input.is_active,
                    },
                )?);
            }
            Ok(created)
        })
        .await?;
        Ok(Json(created).into_response())
    })
    .await
}

fn mint_key(store: &Store, input: &KeyCreate) -> GatewayResult<ApiKey> {
    let account = store.account(&input.user_id)?;
    if account.is_none() {
        return Err(GatewayError::InvalidRequest("User ID does not exist".into()));
    }

    let now = now_ts();
    let record = ApiKey {
        key: generate_key(),
        user_id: input.user_id.clone(),
        key_name: input.key_name.clone(),
        is_active: input.is_active,
        allowed_models: input.allowed_models.clone(),
        created_at: now,
        updated_at: now,
    };
    if !store.create_key(&record)? {
        return Err(GatewayError::Internal("generated key collided".into()));
    }
    Ok(record)
}

async fn list_user_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let keys =
            with_store(&state.store, move |store| Ok(store.keys_for_user(&user_id)?)).await?;
        Ok(Json(keys).into_response())
    })
    .await
}

async fn update_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(patch): Json<KeyPatch>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let lookup = key.clone();
        let record = with_store(&state.store, move |store| Ok(store.update_key(&lookup, &patch)?))
            .await?
            .ok_or_else(|| GatewayError::NotFound("API key not found".into()))?;
        state.cache.invalidate(Namespace::Key, &key).await;
        Ok(Json(record).into_response())
    })
    .await
}

// ----------------------------------------------------------------------
// Prices
// ----------------------------------------------------------------------

async fn upsert_cost(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(input): Json<PriceUpsert>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        if input.model_name.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model_name must not be empty".into()));
        }
        let model_name = input.model_name.clone();
        let price =
            with_store(&state.store, move |store| Ok(store.upsert_price(&input)?)).await?;
        state.cache.invalidate(Namespace::Price, &model_name).await;
        Ok(Json(price).into_response())
    })
    .await
}

async fn list_costs(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let prices = with_store(&state.store, move |store| Ok(store.list_prices()?)).await?;
        Ok(Json(prices).into_response())
    })
    .await
}

async fn get_cost(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let price = with_store(&state.store, move |store| Ok(store.price(&model)?))
            .await?
            .ok_or_else(|| GatewayError::NotFound("Model cost not found".into()))?;
        Ok(Json(price).into_response())
    })
    .await
}

async fn delete_cost(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(model): Path<String>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let lookup = model.clone();
        if !with_store(&state.store, move |store| Ok(store.delete_price(&lookup)?)).await? {
            return Err(GatewayError::NotFound("Model cost not found".into()));
        }
        state.cache.invalidate(Namespace::Price, &model).await;
        Ok(Json(json!({ "deleted": model })).into_response())
    })
    .await
}

// ----------------------------------------------------------------------
// Usage
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct UsageQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

async fn usage_summary(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(window): Query<UsageQuery>,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;

        let start_ts = parse_date(window.start_date.as_deref(), "start_date")?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp());
        let end_ts = parse_date(window.end_date.as_deref(), "end_date")?
            .and_then(|d| d.and_hms_opt(23, 59, 59))
            .map(|dt| dt.and_utc().timestamp());

        let lookup = user_id.clone();
        let (account, summary) = with_store(&state.store, move |store| {
            let account = store
                .account(&lookup)?
                .ok_or_else(|| GatewayError::NotFound("Account not found".into()))?;
            let summary = store.usage_summary(&lookup, start_ts, end_ts)?;
            Ok((account, summary))
        })
        .await?;

        Ok(Json(json!({
            "user_id": user_id,
            "summary": summary,
            "current_budget_usd": account.budget_usd,
            "current_spent_usd": account.spent_usd,
            "remaining_budget_usd": account.remaining_usd(),
            "budget_exceeded": account.over_budget(),
        }))
        .into_response())
    })
    .await
}

/// Which upstream families are usable with the current credentials
async fn provider_configuration(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    respond(async {
        auth::authenticate_admin(&state.settings, &headers)?;
        let providers = json!({
            "openai": {
                "base_url": state.settings.openai.base_url,
                "configured": state.settings.openai.api_key.is_some(),
                "endpoints": ["/v1/chat/completions", "/v1/responses"],
            },
            "anthropic": {
                "base_url": state.settings.anthropic.base_url,
                "configured": state.settings.anthropic.api_key.is_some(),
                "endpoints": ["/v1/messages"],
            },
        });
        Ok(Json(json!({ "providers": providers })).into_response())
    })
    .await
}

fn parse_date(raw: Option<&str>, field: &str) -> GatewayResult<Option<NaiveDate>> {
    match raw {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                GatewayError::InvalidRequest(format!("{} must be YYYY-MM-DD, got '{}'", field, s))
            }),
    }
}

async fn respond<F>(fut: F) -> Response
where
    F: std::future::Future<Output = GatewayResult<Response>>,
{
    match fut.await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_prefix_and_entropy() {
        let a = generate_key();
        let b = generate_key();
        assert!(a.starts_with("gw-"));
        assert_eq!(a.len(), 3 + KEY_RANDOM_LEN);
        assert!(a[3..].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn date_parsing() {
        assert_eq!(parse_date(None, "start_date").unwrap(), None);
        let date = parse_date(Some("2026-08-01"), "start_date").unwrap().unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        assert!(parse_date(Some("08/01/2026"), "start_date").is_err());
    }
}
