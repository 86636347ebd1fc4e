//! Dead-letter stream inspection tool.
//!
//! The dead-letter stream is the operator-facing recovery surface;
//! reprocessing is manual by design.
//!
//! ```text
//! dlq count
//! dlq list [count] [offset]
//! dlq get <stream-id>
//! dlq remove <stream-id>
//! ```

use std::env;

use deadpool_redis::{Config, Runtime};

use relay::config::RelayConfig;
use relay::dlq::DeadLetterQueue;

fn usage() -> ! {
    eprintln!("usage: dlq count");
    eprintln!("       dlq list [count] [offset]");
    eprintln!("       dlq get <stream-id>");
    eprintln!("       dlq remove <stream-id>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();

    let config = RelayConfig::load()?;
    let cfg = Config::from_url(config.redis.url.clone());
    let pool = cfg.create_pool(Some(Runtime::Tokio1))?;
    let dlq = DeadLetterQueue::new(pool);

    match args.first().map(String::as_str) {
        Some("count") => {
            println!("{}", dlq.count().await?);
        }
        Some("list") => {
            let count = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(10);
            let offset = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

            for letter in dlq.list(count, offset).await? {
                println!(
                    "{}  event_id={}  type={}  entity={}",
                    letter.stream_id,
                    letter.envelope.event_id,
                    letter.envelope.event_type,
                    letter.envelope.entity.id,
                );
            }
        }
        Some("get") => {
            let id = args.get(1).unwrap_or_else(|| usage());
            match dlq.get(id).await? {
                Some(letter) => {
                    println!("{}", serde_json::to_string_pretty(&letter.envelope)?)
                }
                None => {
                    eprintln!("not found: {}", id);
                    std::process::exit(1);
                }
            }
        }
        Some("remove") => {
            let id = args.get(1).unwrap_or_else(|| usage());
            if dlq.remove(id).await? {
                println!("removed {}", id);
            } else {
                eprintln!("not found: {}", id);
                std::process::exit(1);
            }
        }
        _ => usage(),
    }

    Ok(())
}
