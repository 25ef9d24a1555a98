//! Tidepool: In-Memory Time-Series Cache
//!
//! A bounded in-memory cache for streaming quotes and telemetry ticks:
//! write-heavy ingest from a message bus, point-in-time range queries over
//! HTTP, and age-based expiry.
//!
//! # Features
//!
//! - **Sharded Single-Writer Storage**: Keys hash to worker-owned shards;
//!   no per-key locking anywhere
//! - **Out-Of-Order Absorption**: Late ticks land in timestamp order
//! - **Bounded Retention**: Samples expire after a configurable age, with an
//!   optional eviction callback for downsampling or persistence
//! - **Backpressure**: Bounded per-shard inboxes slow producers down instead
//!   of growing without limit
//! - **Kafka Ingest**: Optional bus consumer (enable with the `kafka` feature)
//! - **Bearer-Token Auth**: Pluggable login/token handlers on the API
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use tidepool::storage::{Engine, Options, NO_LOWER_BOUND, NO_UPPER_BOUND};
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = Engine::new(Options::default());
//!
//!     // One tick per write; timestamps are ns since the Unix epoch
//!     engine
//!         .write("AAPL", 1_700_000_000_000_000_000, Bytes::from("175.32"))
//!         .await
//!         .unwrap();
//!
//!     let ticks = engine
//!         .search("AAPL", NO_LOWER_BOUND, NO_UPPER_BOUND)
//!         .await
//!         .unwrap();
//!     println!("{} ticks", ticks.len());
//!
//!     engine.close().await;
//! }
//! ```

pub mod api;
pub mod ingest;
pub mod storage;

// Re-export commonly used types
pub use storage::{
    Engine, EngineError, ExpiryHandler, Options, Sample, NO_LOWER_BOUND, NO_UPPER_BOUND,
};
