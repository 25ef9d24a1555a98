//! Kafka consumer feeding the storage engine.
//!
//! Subscribes to the configured topics and performs one engine write per
//! message. Offsets are committed after the write lands, so a restart
//! replays at-least-once rather than losing ticks.
//!
//! ## Message Format
//!
//! Messages are JSON, one tick per message:
//! ```json
//! {"key": "AAPL", "timestamp": 1700000000000000000, "data": "175.32"}
//! ```
//! with `timestamp` in nanoseconds since the Unix epoch, or a batch:
//! ```json
//! {"messages": [{"key": "AAPL", "timestamp": 1700000000000000000, "data": "175.32"}]}
//! ```
//!
//! ## Configuration
//!
//! Environment variables:
//! - `TIDEPOOL_BROKER_ADDRESS`: Comma-separated broker list (default: localhost:9092)
//! - `TIDEPOOL_TOPICS`: Comma-separated topics to consume
//! - `TIDEPOOL_GROUP_ID`: Consumer group ID (default: tidepool)
//! - `TIDEPOOL_AUTO_OFFSET_RESET`: Where to start without an offset (default: earliest)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use serde::Deserialize;
use tokio::sync::watch;

use crate::storage::{Engine, EngineError};

/// Kafka consumer configuration
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka broker addresses
    pub brokers: String,
    /// Topics to consume from
    pub topics: Vec<String>,
    /// Consumer group ID
    pub group_id: String,
    /// Auto offset reset (earliest or latest)
    pub auto_offset_reset: String,
    /// Session timeout in ms
    pub session_timeout_ms: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topics: vec![],
            group_id: "tidepool".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 30000,
        }
    }
}

impl KafkaConfig {
    /// Create config from environment variables. `None` when no topics are
    /// configured, which disables bus ingest entirely.
    pub fn from_env() -> Option<Self> {
        let topics = std::env::var("TIDEPOOL_TOPICS").ok()?;
        if topics.is_empty() {
            return None;
        }

        let defaults = Self::default();
        Some(Self {
            brokers: std::env::var("TIDEPOOL_BROKER_ADDRESS").unwrap_or(defaults.brokers),
            topics: topics.split(',').map(|s| s.trim().to_string()).collect(),
            group_id: std::env::var("TIDEPOOL_GROUP_ID").unwrap_or(defaults.group_id),
            auto_offset_reset: std::env::var("TIDEPOOL_AUTO_OFFSET_RESET")
                .unwrap_or(defaults.auto_offset_reset),
            session_timeout_ms: defaults.session_timeout_ms,
        })
    }
}

/// One tick on the bus.
#[derive(Debug, Deserialize)]
struct TickMessage {
    key: String,
    /// Nanoseconds since the Unix epoch.
    timestamp: i64,
    #[serde(default)]
    data: String,
}

/// Statistics from the Kafka consumer
#[derive(Debug, Default, Clone)]
pub struct KafkaStats {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub samples_written: u64,
    pub errors: u64,
    pub last_offset: HashMap<String, i64>,
}

/// Kafka consumer for ingesting ticks into tidepool
pub struct KafkaConsumer {
    config: KafkaConfig,
    engine: Arc<Engine>,
    consumer: StreamConsumer,
    stats: Arc<parking_lot::RwLock<KafkaStats>>,
}

/// Handle to a running consumer; dropping it leaves the consumer running,
/// [`stop`](KafkaConsumerHandle::stop) shuts it down and joins the task.
pub struct KafkaConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    stats: Arc<parking_lot::RwLock<KafkaStats>>,
}

impl KafkaConsumerHandle {
    pub fn stats(&self) -> KafkaStats {
        self.stats.read().clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "Kafka consumer task exited abnormally");
        }
    }
}

impl KafkaConsumer {
    /// Create a new Kafka consumer
    pub fn new(config: KafkaConfig, engine: Arc<Engine>) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            // Optimize for throughput
            .set("fetch.min.bytes", "1024")
            .set("fetch.max.wait.ms", "100")
            .create()?;

        Ok(Self {
            config,
            engine,
            consumer,
            stats: Arc::new(parking_lot::RwLock::new(KafkaStats::default())),
        })
    }

    /// Subscribe to configured topics
    pub fn subscribe(&self) -> Result<(), KafkaError> {
        let topics: Vec<&str> = self.config.topics.iter().map(|s| s.as_str()).collect();
        self.consumer.subscribe(&topics)?;
        tracing::info!("Subscribed to Kafka topics: {:?}", self.config.topics);
        Ok(())
    }

    /// Start consuming in the background.
    pub fn start(self) -> KafkaConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let consumer = self.consumer;
        let engine = self.engine;
        let stats = Arc::clone(&self.stats);
        let loop_stats = Arc::clone(&self.stats);

        let task = tokio::spawn(async move {
            tracing::info!("Kafka consumer started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Kafka consumer shutting down");
                        break;
                    }
                    result = consumer.recv() => {
                        match result {
                            Ok(message) => {
                                let topic = message.topic().to_string();
                                let partition = message.partition();
                                let offset = message.offset();

                                {
                                    let mut s = loop_stats.write();
                                    s.messages_received += 1;
                                }

                                let payload = message.payload().unwrap_or_default();
                                match process_message(&engine, payload).await {
                                    Ok(written) => {
                                        // Commit offset after the write landed
                                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                            tracing::error!(
                                                topic = %topic,
                                                partition = partition,
                                                offset = offset,
                                                error = %e,
                                                "Failed to commit offset"
                                            );
                                        }

                                        let mut s = loop_stats.write();
                                        s.messages_processed += 1;
                                        s.samples_written += written as u64;
                                        s.last_offset.insert(
                                            format!("{}:{}", topic, partition),
                                            offset
                                        );
                                    }
                                    Err(e) => {
                                        tracing::error!(
                                            topic = %topic,
                                            partition = partition,
                                            offset = offset,
                                            error = %e,
                                            "Failed to process message"
                                        );
                                        let mut s = loop_stats.write();
                                        s.errors += 1;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "Kafka receive error");
                                // Back off on error
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                }
            }
        });

        KafkaConsumerHandle {
            shutdown: shutdown_tx,
            task,
            stats,
        }
    }
}

/// Decode a bus message and write its ticks; returns the number written.
async fn process_message(engine: &Engine, payload: &[u8]) -> Result<usize, ProcessError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| ProcessError::Parse(e.to_string()))?;

    if let Some(batch) = value.get("messages").and_then(|v| v.as_array()) {
        let mut written = 0;
        for entry in batch {
            write_tick(engine, entry.clone()).await?;
            written += 1;
        }
        return Ok(written);
    }

    write_tick(engine, value).await?;
    Ok(1)
}

async fn write_tick(engine: &Engine, value: serde_json::Value) -> Result<(), ProcessError> {
    let tick: TickMessage =
        serde_json::from_value(value).map_err(|e| ProcessError::Parse(e.to_string()))?;
    engine
        .write(&tick.key, tick.timestamp, Bytes::from(tick.data))
        .await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Write error: {0}")]
    Write(#[from] EngineError),
}
