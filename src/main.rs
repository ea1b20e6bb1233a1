//! Event Relay Server
//!
//! Accepts forwarded host events and admin setting writes over HTTP. Events
//! are normalized and queued on the Redis job stream for `relay-worker`.
//!
//! ## Configuration
//!
//! - `RELAY_CONFIG`: path to the TOML config (default: `config/relay.toml`)
//! - `REDIS_URL`: overrides `redis.url`
//! - `RELAY_API_KEY`: overrides `server.api_key`
//! - `PORT`: overrides `server.port`
//! - `NC_webhook_rabbitmq_<key>`: relay setting fallbacks
//! - `RUST_LOG`: logging level (default: "info")

use deadpool_redis::{Config, Runtime};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use event_relay::api::{self, ApiState};
use event_relay::config::ServiceConfig;
use event_relay::listener::DispatchListener;
use event_relay::queue::RedisJobQueue;
use event_relay::settings::resolver::migrate_legacy_enabled;
use event_relay::settings::{ConfigResolver, RedisSettingStore};
use event_relay::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::load()?;

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());
    let api_key = env::var("RELAY_API_KEY")
        .ok()
        .or_else(|| config.server.api_key.clone())
        .filter(|key| !key.is_empty() && !key.contains("${"))
        .unwrap_or_else(|| {
            warn!("RELAY_API_KEY not set, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });
    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.server.port);

    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

    let store = Arc::new(RedisSettingStore::new(pool.clone()));
    migrate_legacy_enabled(store.as_ref()).await;
    if let Err(e) = config.seed_settings(store.as_ref()).await {
        warn!(error = %e, "Failed to seed relay settings");
    }

    let resolver = ConfigResolver::new(store);
    let listener = DispatchListener::new(resolver.clone(), Arc::new(RedisJobQueue::new(pool)));

    let app = api::router(Arc::new(ApiState {
        config: resolver,
        listener,
        api_key,
    }));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Event relay listening on {}", addr);

    let shutdown = ShutdownSignal::new();
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(tcp, app)
        .with_graceful_shutdown(async move { shutdown.listen().await })
        .await?;

    info!("Event relay stopped");
    Ok(())
}
