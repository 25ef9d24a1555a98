//! Ingest sources for tidepool
//!
//! Ticks arrive over the message bus; the HTTP API is query-only. Kafka
//! support is optional, enable with the `kafka` feature.

#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaConsumer, KafkaConsumerHandle};
