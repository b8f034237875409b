use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use llm_gateway::cache::{self, Cache, CacheBus};
use llm_gateway::config::Settings;
use llm_gateway::db::Store;
use llm_gateway::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("invalid configuration")?;

    let filter = EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::fs::create_dir_all(&settings.store_dir)
        .with_context(|| format!("cannot create store directory {:?}", settings.store_dir))?;
    let store = Store::open(settings.store_path())
        .with_context(|| format!("cannot open store at {:?}", settings.store_path()))?;
    tracing::info!(path = %settings.store_path().display(), "store ready");

    let bus = CacheBus::connect(&settings.cache_bus_uri)
        .await
        .with_context(|| format!("cache bus unreachable at {}", settings.cache_bus_uri))?;
    tracing::info!(uri = %settings.cache_bus_uri, "cache bus connected");

    let cache = Arc::new(Cache::new(
        store.clone(),
        settings.cache_max_entries,
        settings.cache_ttl,
        Some(Arc::new(bus)),
    ));
    cache::spawn_invalidation_listener(cache.clone());

    let bind_addr = settings.bind_addr();
    let state = Arc::new(AppState { settings, store, cache });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", bind_addr))?;
    tracing::info!(addr = %bind_addr, "gateway listening");

    server::serve(state, listener).await.context("server error")?;
    tracing::info!("gateway stopped");
    Ok(())
}
