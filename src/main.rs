//! Relay sync worker.
//!
//! Consumes customer change events from the event stream and delivers them
//! to the downstream ticketing system, escalating failures to the
//! dead-letter stream.
//!
//! ## Configuration
//!
//! `config/relay.toml` (override with `RELAY_CONFIG`), plus:
//! - `RUST_LOG`: logging level (default: "info")

use std::sync::Arc;

use deadpool_redis::{Config, Runtime};
use tracing::{error, info};

use relay::config::RelayConfig;
use relay::consumer::Consumer;
use relay::handler::SyncHandler;
use relay::publisher::RedisPublisher;
use relay::shutdown::ShutdownSignal;
use relay::ticketing::ServiceNowClient;

/// Member name from config, hostname, or a generated fallback.
fn consumer_name(config: &RelayConfig) -> String {
    if let Some(name) = &config.consumer.name {
        return name.clone();
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("sync-{}", name);
        }
    }

    format!("sync-{}", uuid::Uuid::new_v4())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let config = RelayConfig::load()?;
    let name = consumer_name(&config);

    info!(
        group = %config.consumer.group,
        consumer = %name,
        "Relay sync worker starting"
    );

    // Process-wide connection pool, created once and shared by reference.
    let cfg = Config::from_url(config.redis.url.clone());
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;

    let dead_letters = Arc::new(RedisPublisher::new(pool.clone()));
    let ticketing = Arc::new(ServiceNowClient::new(&config.ticketing));
    let handler = Arc::new(SyncHandler::new(ticketing, dead_letters));

    let consumer = Consumer::new(pool, config.consumer.group.clone(), name, handler);
    consumer.ensure_group().await?;

    let shutdown = ShutdownSignal::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move { shutdown.wait().await });

    match consumer.run(receiver).await {
        Ok(()) => {
            info!("Worker shutdown complete");
            Ok(())
        }
        Err(e) => {
            // Recovery is an external restart; exit loudly.
            error!(error = %e, "Consumer terminated on fatal error");
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
