//! Persistent store
//!
//! SQLite-backed records for accounts, keys, model prices, and usage logs.
//! The store exposes exactly the operations the gateway core needs:
//! point-gets by unique field, admin upserts, append-only usage logging, and
//! the atomic conditional debit that billing correctness rests on.
//! `spent_usd` is only ever changed through [`Store::atomic_debit`].

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Budget window attached to an account. Stored and surfaced everywhere,
/// but no reset job exists: only `total` is functionally enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
    #[default]
    Total,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Daily => "daily",
            BudgetPeriod::Weekly => "weekly",
            BudgetPeriod::Monthly => "monthly",
            BudgetPeriod::Total => "total",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(BudgetPeriod::Daily),
            "weekly" => Some(BudgetPeriod::Weekly),
            "monthly" => Some(BudgetPeriod::Monthly),
            "total" => Some(BudgetPeriod::Total),
            _ => None,
        }
    }
}

/// Billing tenant
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub user_id: String,
    pub account_name: Option<String>,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub budget_period: BudgetPeriod,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn remaining_usd(&self) -> f64 {
        (self.budget_usd - self.spent_usd).max(0.0)
    }

    pub fn over_budget(&self) -> bool {
        self.spent_usd >= self.budget_usd
    }
}

/// Bearer credential owned by an account
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub key: String,
    pub user_id: String,
    pub key_name: Option<String>,
    pub is_active: bool,
    /// Exact model IDs this key may use; empty means all models
    pub allowed_models: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ApiKey {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

/// Per-model pricing, USD per million tokens
#[derive(Debug, Clone, Serialize)]
pub struct ModelPrice {
    pub model_name: String,
    pub provider: String,
    pub input_rate: f64,
    pub output_rate: f64,
    pub cache_read_rate: f64,
    pub cache_write_rate: f64,
    pub updated_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct AccountCreate {
    pub user_id: String,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub budget_usd: f64,
    #[serde(default)]
    pub budget_period: BudgetPeriod,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountPatch {
    pub account_name: Option<String>,
    pub budget_usd: Option<f64>,
    pub budget_period: Option<BudgetPeriod>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct KeyPatch {
    pub key_name: Option<String>,
    pub is_active: Option<bool>,
    pub allowed_models: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PriceUpsert {
    pub model_name: String,
    pub provider: String,
    pub input_rate: f64,
    pub output_rate: f64,
    #[serde(default)]
    pub cache_read_rate: f64,
    #[serde(default)]
    pub cache_write_rate: f64,
}

fn default_true() -> bool {
    true
}

/// One usage-log row, ready to append
#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub user_id: String,
    pub key: String,
    pub model: String,
    pub endpoint: String,
    pub ip: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub is_cache_hit: bool,
    pub is_estimated: bool,
    pub processing_ms: i64,
    pub error_message: Option<String>,
    pub request_payload: Value,
    pub response_payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageLogEntry {
    pub id: i64,
    pub user_id: String,
    pub key: String,
    pub model: String,
    pub endpoint: String,
    pub ip: Option<String>,
    pub timestamp: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub is_cache_hit: bool,
    pub is_estimated: bool,
    pub processing_ms: i64,
    pub error_message: Option<String>,
}

/// Usage totals over a time window
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub total_cost_usd: f64,
    pub total_tokens: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cache_read_tokens: i64,
    pub total_cache_write_tokens: i64,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Handle to the SQLite store. Cheap to clone; each call opens its own
/// connection, so callers on the async hot path can move a clone into
/// `spawn_blocking`.
#[derive(Clone)]
pub struct Store {
    path: Arc<PathBuf>,
}

impl Store {
    pub fn open(path: PathBuf) -> rusqlite::Result<Self> {
        let store = Store { path: Arc::new(path) };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(self.path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "busy_timeout", 5000).ok();
        Ok(conn)
    }

    fn init(&self) -> rusqlite::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "create table if not exists accounts (
                user_id text primary key,
                account_name text,
                budget_usd real not null default 0,
                spent_usd real not null default 0,
                budget_period text not null default 'total',
                is_active integer not null default 1,
                created_at integer not null,
                updated_at integer not null)",
            [],
        )?;
        conn.execute(
            "create table if not exists keys (
                key text primary key,
                user_id text not null,
                key_name text,
                is_active integer not null default 1,
                allowed_models text,
                created_at integer not null,
                updated_at integer not null)",
            [],
        )?;
        conn.execute(
            "create table if not exists prices (
                model_name text primary key,
                provider text not null,
                input_rate real not null default 0,
                output_rate real not null default 0,
                cache_read_rate real not null default 0,
                cache_write_rate real not null default 0,
                updated_at integer not null)",
            [],
        )?;
        conn.execute(
            "create table if not exists usage_logs (
                id integer primary key autoincrement,
                user_id text not null,
                key text not null,
                model text not null,
                endpoint text not null,
                ip text,
                timestamp integer not null,
                input_tokens integer not null default 0,
                output_tokens integer not null default 0,
                cache_read_tokens integer not null default 0,
                cache_write_tokens integer not null default 0,
                total_tokens integer not null default 0,
                cost_usd real not null default 0,
                is_cache_hit integer not null default 0,
                is_estimated integer not null default 0,
                processing_ms integer not null default 0,
                error_message text,
                request_payload text,
                response_payload text)",
            [],
        )?;

        conn.execute("create index if not exists idx_keys_user on keys(user_id)", [])?;
        conn.execute(
            "create index if not exists idx_usage_user_ts on usage_logs(user_id, timestamp desc)",
            [],
        )?;
        conn.execute("create index if not exists idx_usage_key on usage_logs(key)", [])?;
        conn.execute(
            "create index if not exists idx_usage_ts on usage_logs(timestamp)",
            [],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Insert a new account. Returns `None` when the user_id already exists.
    pub fn create_account(&self, input: &AccountCreate) -> rusqlite::Result<Option<Account>> {
        let conn = self.conn()?;
        let now = now_ts();
        let inserted = conn.execute(
            "insert into accounts(user_id, account_name, budget_usd, spent_usd, budget_period, is_active, created_at, updated_at)
             values(?1, ?2, ?3, 0, ?4, ?5, ?6, ?6)
             on conflict(user_id) do nothing",
            params![
                input.user_id,
                input.account_name,
                input.budget_usd,
                input.budget_period.as_str(),
                input.is_active as i64,
                now
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        self.account(&input.user_id)
    }

    pub fn account(&self, user_id: &str) -> rusqlite::Result<Option<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select user_id, account_name, budget_usd, spent_usd, budget_period, is_active, created_at, updated_at
             from accounts where user_id = ?1",
        )?;
        stmt.query_row(params![user_id], row_to_account).optional()
    }

    pub fn list_accounts(&self, limit: i64, offset: i64) -> rusqlite::Result<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select user_id, account_name, budget_usd, spent_usd, budget_period, is_active, created_at, updated_at
             from accounts order by created_at, user_id limit ?1 offset ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], row_to_account)?;
        rows.collect()
    }

    pub fn update_account(
        &self,
        user_id: &str,
        patch: &AccountPatch,
    ) -> rusqlite::Result<Option<Account>> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "update accounts set
                account_name = coalesce(?2, account_name),
                budget_usd = coalesce(?3, budget_usd),
                budget_period = coalesce(?4, budget_period),
                is_active = coalesce(?5, is_active),
                updated_at = ?6
             where user_id = ?1",
            params![
                user_id,
                patch.account_name,
                patch.budget_usd,
                patch.budget_period.map(|p| p.as_str()),
                patch.is_active.map(|b| b as i64),
                now_ts()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.account(user_id)
    }

    /// Atomic conditional debit: adds `amount_usd` to `spent_usd` only while
    /// the account is active. Returns whether a row matched. This is the only
    /// write path for `spent_usd`.
    pub fn atomic_debit(&self, user_id: &str, amount_usd: f64) -> rusqlite::Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "update accounts set spent_usd = spent_usd + ?2, updated_at = ?3
             where user_id = ?1 and is_active = 1",
            params![user_id, amount_usd, now_ts()],
        )?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Insert a key record. Returns false when the key string already exists.
    pub fn create_key(&self, key: &ApiKey) -> rusqlite::Result<bool> {
        let conn = self.conn()?;
        let allowed = serialize_allowed(&key.allowed_models);
        let inserted = conn.execute(
            "insert into keys(key, user_id, key_name, is_active, allowed_models, created_at, updated_at)
             values(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             on conflict(key) do nothing",
            params![
                key.key,
                key.user_id,
                key.key_name,
                key.is_active as i64,
                allowed,
                key.created_at,
                key.updated_at
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn api_key(&self, key: &str) -> rusqlite::Result<Option<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select key, user_id, key_name, is_active, allowed_models, created_at, updated_at
             from keys where key = ?1",
        )?;
        stmt.query_row(params![key], row_to_key).optional()
    }

    pub fn keys_for_user(&self, user_id: &str) -> rusqlite::Result<Vec<ApiKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select key, user_id, key_name, is_active, allowed_models, created_at, updated_at
             from keys where user_id = ?1 order by created_at",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_key)?;
        rows.collect()
    }

    pub fn update_key(&self, key: &str, patch: &KeyPatch) -> rusqlite::Result<Option<ApiKey>> {
        let conn = self.conn()?;
        // An explicit empty list overwrites the stored list (= all allowed),
        // so serialize the patch value even when empty.
        let allowed = patch
            .allowed_models
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "[]".to_string()));
        let changed = conn.execute(
            "update keys set
                key_name = coalesce(?2, key_name),
                is_active = coalesce(?3, is_active),
                allowed_models = coalesce(?4, allowed_models),
                updated_at = ?5
             where key = ?1",
            params![
                key,
                patch.key_name,
                patch.is_active.map(|b| b as i64),
                allowed,
                now_ts()
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.api_key(key)
    }

    // ------------------------------------------------------------------
    // Prices
    // ------------------------------------------------------------------

    /// Create or replace pricing for a model. Posting the same model twice
    /// keeps one row with the later payload.
    pub fn upsert_price(&self, input: &PriceUpsert) -> rusqlite::Result<ModelPrice> {
        let conn = self.conn()?;
        let now = now_ts();
        conn.execute(
            "insert into prices(model_name, provider, input_rate, output_rate, cache_read_rate, cache_write_rate, updated_at)
             values(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             on conflict(model_name) do update set
                provider = excluded.provider,
                input_rate = excluded.input_rate,
                output_rate = excluded.output_rate,
                cache_read_rate = excluded.cache_read_rate,
                cache_write_rate = excluded.cache_write_rate,
                updated_at = excluded.updated_at",
            params![
                input.model_name,
                input.provider,
                input.input_rate,
                input.output_rate,
                input.cache_read_rate,
                input.cache_write_rate,
                now
            ],
        )?;
        Ok(ModelPrice {
            model_name: input.model_name.clone(),
            provider: input.provider.clone(),
            input_rate: input.input_rate,
            output_rate: input.output_rate,
            cache_read_rate: input.cache_read_rate,
            cache_write_rate: input.cache_write_rate,
            updated_at: now,
        })
    }

    pub fn price(&self, model_name: &str) -> rusqlite::Result<Option<ModelPrice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select model_name, provider, input_rate, output_rate, cache_read_rate, cache_write_rate, updated_at
             from prices where model_name = ?1",
        )?;
        stmt.query_row(params![model_name], row_to_price).optional()
    }

    pub fn list_prices(&self) -> rusqlite::Result<Vec<ModelPrice>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select model_name, provider, input_rate, output_rate, cache_read_rate, cache_write_rate, updated_at
             from prices order by model_name",
        )?;
        let rows = stmt.query_map([], row_to_price)?;
        rows.collect()
    }

    pub fn delete_price(&self, model_name: &str) -> rusqlite::Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("delete from prices where model_name = ?1", params![model_name])?;
        Ok(deleted > 0)
    }

    // ------------------------------------------------------------------
    // Usage logs
    // ------------------------------------------------------------------

    pub fn append_usage(&self, log: &NewUsageLog) -> rusqlite::Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "insert into usage_logs(user_id, key, model, endpoint, ip, timestamp,
                input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, total_tokens,
                cost_usd, is_cache_hit, is_estimated, processing_ms, error_message,
                request_payload, response_payload)
             values(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                log.user_id,
                log.key,
                log.model,
                log.endpoint,
                log.ip,
                now_ts(),
                log.input_tokens,
                log.output_tokens,
                log.cache_read_tokens,
                log.cache_write_tokens,
                log.total_tokens,
                log.cost_usd,
                log.is_cache_hit as i64,
                log.is_estimated as i64,
                log.processing_ms,
                log.error_message,
                log.request_payload.to_string(),
                log.response_payload.to_string()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn logs_for_user(&self, user_id: &str, limit: i64, offset: i64) -> rusqlite::Result<Vec<UsageLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select id, user_id, key, model, endpoint, ip, timestamp,
                input_tokens, output_tokens, cache_read_tokens, cache_write_tokens, total_tokens,
                cost_usd, is_cache_hit, is_estimated, processing_ms, error_message
             from usage_logs where user_id = ?1 order by timestamp desc limit ?2 offset ?3",
        )?;
        let rows = stmt.query_map(params![user_id, limit, offset], row_to_log)?;
        rows.collect()
    }

    /// Usage totals for a user over an optional `[start, end]` window of
    /// unix-second timestamps.
    pub fn usage_summary(
        &self,
        user_id: &str,
        start_ts: Option<i64>,
        end_ts: Option<i64>,
    ) -> rusqlite::Result<UsageSummary> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "select count(*),
                ifnull(sum(cost_usd), 0),
                ifnull(sum(total_tokens), 0),
                ifnull(sum(input_tokens), 0),
                ifnull(sum(output_tokens), 0),
                ifnull(sum(cache_read_tokens), 0),
                ifnull(sum(cache_write_tokens), 0)
             from usage_logs
             where user_id = ?1
               and timestamp >= ifnull(?2, timestamp)
               and timestamp <= ifnull(?3, timestamp)",
        )?;
        stmt.query_row(params![user_id, start_ts, end_ts], |row| {
            Ok(UsageSummary {
                total_requests: row.get(0)?,
                total_cost_usd: row.get(1)?,
                total_tokens: row.get(2)?,
                total_input_tokens: row.get(3)?,
                total_output_tokens: row.get(4)?,
                total_cache_read_tokens: row.get(5)?,
                total_cache_write_tokens: row.get(6)?,
            })
        })
    }
}

fn serialize_allowed(models: &[String]) -> Option<String> {
    if models.is_empty() {
        None
    } else {
        serde_json::to_string(models).ok()
    }
}

fn parse_allowed(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let period: String = row.get(4)?;
    Ok(Account {
        user_id: row.get(0)?,
        account_name: row.get(1)?,
        budget_usd: row.get(2)?,
        spent_usd: row.get(3)?,
        budget_period: BudgetPeriod::parse(&period).unwrap_or_default(),
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        key: row.get(0)?,
        user_id: row.get(1)?,
        key_name: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        allowed_models: parse_allowed(row.get(4)?),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_price(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelPrice> {
    Ok(ModelPrice {
        model_name: row.get(0)?,
        provider: row.get(1)?,
        input_rate: row.get(2)?,
        output_rate: row.get(3)?,
        cache_read_rate: row.get(4)?,
        cache_write_rate: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageLogEntry> {
    Ok(UsageLogEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        key: row.get(2)?,
        model: row.get(3)?,
        endpoint: row.get(4)?,
        ip: row.get(5)?,
        timestamp: row.get(6)?,
        input_tokens: row.get(7)?,
        output_tokens: row.get(8)?,
        cache_read_tokens: row.get(9)?,
        cache_write_tokens: row.get(10)?,
        total_tokens: row.get(11)?,
        cost_usd: row.get(12)?,
        is_cache_hit: row.get::<_, i64>(13)? != 0,
        is_estimated: row.get::<_, i64>(14)? != 0,
        processing_ms: row.get(15)?,
        error_message: row.get(16)?,
    })
}
