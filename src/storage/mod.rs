//! Sharded single-writer storage engine.
//!
//! Keys hash to shards; each shard is a worker task that exclusively owns its
//! key map and multiplexes writes, searches, and a periodic expiry tick
//! through one bounded inbox. No per-key locking anywhere.

pub mod engine;
pub mod router;
pub mod series;

mod shard;

pub use engine::{
    Engine, EngineError, ExpiryHandler, Options, DEFAULT_INBOX_CAPACITY, DEFAULT_MAX_AGE,
    DEFAULT_WORKER_COUNT, NO_LOWER_BOUND, NO_UPPER_BOUND,
};
pub use series::{Sample, Series};
