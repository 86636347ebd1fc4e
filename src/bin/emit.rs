//! Manual event emitter.
//!
//! Stands in for the upstream persistence layer's post-commit hook: builds a
//! customer snapshot from arguments and runs it through the observer →
//! publisher path.
//!
//! ```text
//! emit created <name> <email> [status]
//! emit updated <customer-uuid> <name> <email> [status]
//! ```

use std::env;
use std::sync::Arc;

use chrono::Utc;
use deadpool_redis::{Config, Runtime};
use tracing::info;
use uuid::Uuid;

use relay::config::RelayConfig;
use relay::event::CustomerSnapshot;
use relay::observer::CustomerChangeObserver;
use relay::publisher::RedisPublisher;

fn usage() -> ! {
    eprintln!("usage: emit created <name> <email> [status]");
    eprintln!("       emit updated <customer-uuid> <name> <email> [status]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let (created, id, rest) = match args.first().map(String::as_str) {
        Some("created") => (true, Uuid::new_v4(), &args[1..]),
        Some("updated") => {
            let id = args
                .get(1)
                .and_then(|s| Uuid::parse_str(s).ok())
                .unwrap_or_else(|| usage());
            (false, id, &args[2..])
        }
        _ => usage(),
    };

    if rest.len() < 2 {
        usage();
    }

    let snapshot = CustomerSnapshot {
        id: Some(id),
        name: rest[0].clone(),
        email: rest[1].clone(),
        status: rest.get(2).cloned().unwrap_or_else(|| "active".to_string()),
        updated_at: Some(Utc::now()),
    };

    let config = RelayConfig::load()?;
    let cfg = Config::from_url(config.redis.url.clone());
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;

    let publisher = Arc::new(RedisPublisher::new(pool));
    let observer = CustomerChangeObserver::new(publisher.clone());

    observer.record_saved(&snapshot, created);

    // Publication is fire-and-forget on a spawned task; wait for the append
    // to land (or fail and be logged) before the process exits.
    publisher.flush().await;

    info!(customer_id = %id, created = created, "Emit complete");
    Ok(())
}
