//! Tidepool Server
//!
//! Run with: cargo run
//!
//! Environment variables:
//! - TIDEPOOL_HOST: Bind address (default: 0.0.0.0)
//! - TIDEPOOL_PORT: Port number (default: 8088)
//! - TIDEPOOL_MAX_AGE_SECS: Sample retention window in seconds (default: 3600)
//! - TIDEPOOL_WORKER_COUNT: Number of storage shards (default: 128)
//! - TIDEPOOL_INBOX_CAPACITY: Per-shard write buffer (default: 512)
//! - RUST_LOG: Log level (default: info)
//!
//! Kafka ingest (requires the `kafka` feature):
//! - TIDEPOOL_BROKER_ADDRESS: Comma-separated broker list (default: localhost:9092)
//! - TIDEPOOL_TOPICS: Comma-separated topics; unset disables ingest
//! - TIDEPOOL_GROUP_ID: Consumer group ID (default: tidepool)

use std::sync::Arc;

use tidepool::api::{run_server, AppState, ServerConfig};
use tidepool::storage::{Engine, Options};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tidepool=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let opts = Options::from_env();
    let server_config = ServerConfig::from_env();

    tracing::info!("tidepool configuration:");
    tracing::info!("  Host: {}:{}", server_config.host, server_config.port);
    tracing::info!("  Max sample age: {:?}", opts.max_age);
    tracing::info!("  Shards: {}", opts.worker_count);
    tracing::info!("  Inbox capacity: {}", opts.inbox_capacity);

    let engine = Arc::new(Engine::new(opts));

    #[cfg(feature = "kafka")]
    let consumer = match tidepool::ingest::KafkaConfig::from_env() {
        Some(config) => {
            let consumer = tidepool::ingest::KafkaConsumer::new(config, Arc::clone(&engine))?;
            consumer.subscribe()?;
            Some(consumer.start())
        }
        None => {
            tracing::info!("No Kafka topics configured; bus ingest disabled");
            None
        }
    };

    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
        auth: None,
        login: None,
    });

    run_server(server_config, state).await?;

    #[cfg(feature = "kafka")]
    if let Some(consumer) = consumer {
        consumer.stop().await;
    }

    // Drain and join the shard workers before exit
    engine.close().await;

    Ok(())
}
