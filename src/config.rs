//! Process configuration
//!
//! Everything is read once from the environment at startup. Missing provider
//! credentials do not prevent startup; requests routed to an unconfigured
//! provider fail with a descriptive error instead.

use std::path::PathBuf;
use std::time::Duration;

use crate::forward::context::Provider;

/// Credentials and base URL for one upstream provider family
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the SQLite database
    pub store_dir: PathBuf,
    /// Database file name inside `store_dir`
    pub store_db: String,
    /// Redis-compatible URI for the cache invalidation bus
    pub cache_bus_uri: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Static secret protecting the admin surface
    pub admin_key: String,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    pub openai: ProviderCredentials,
    pub anthropic: ProviderCredentials,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidVar(&'static str, String),
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_opt(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidVar(name, raw)),
        None => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_dir = env_opt("STORE_URI").map(PathBuf::from).unwrap_or_else(|| {
            let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
            p.push("llm-gateway");
            p
        });

        Ok(Settings {
            store_dir,
            store_db: env_opt("STORE_DB").unwrap_or_else(|| "gateway.db".to_string()),
            cache_bus_uri: env_opt("CACHE_BUS_URI")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            host: env_opt("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env_parse("PORT", 8080)?,
            log_level: env_opt("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            admin_key: env_opt("ADMIN_KEY").ok_or(ConfigError::MissingVar("ADMIN_KEY"))?,
            cache_max_entries: env_parse("CACHE_MAX_ENTRIES", 10_000)?,
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 300)?),
            openai: ProviderCredentials {
                api_key: env_opt("OPENAI_API_KEY"),
                base_url: env_opt("OPENAI_BASE_URL")
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
            },
            anthropic: ProviderCredentials {
                api_key: env_opt("ANTHROPIC_API_KEY"),
                base_url: env_opt("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            },
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_dir.join(&self.store_db)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn credentials(&self, provider: Provider) -> &ProviderCredentials {
        match provider {
            Provider::OpenAI => &self.openai,
            Provider::Anthropic => &self.anthropic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_path_joins_dir_and_db() {
        let settings = Settings {
            store_dir: PathBuf::from("/tmp/gw"),
            store_db: "gateway.db".into(),
            cache_bus_uri: "redis://127.0.0.1:6379".into(),
            host: "127.0.0.1".into(),
            port: 8080,
            log_level: "info".into(),
            admin_key: "secret".into(),
            cache_max_entries: 10,
            cache_ttl: Duration::from_secs(300),
            openai: ProviderCredentials {
                api_key: None,
                base_url: "https://api.openai.com".into(),
            },
            anthropic: ProviderCredentials {
                api_key: None,
                base_url: "https://api.anthropic.com".into(),
            },
        };
        assert_eq!(settings.store_path(), PathBuf::from("/tmp/gw/gateway.db"));
        assert_eq!(settings.bind_addr(), "127.0.0.1:8080");
    }
}
