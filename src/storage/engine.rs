use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::Counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::router;
use super::series::Sample;
use super::shard::{self, Task};

/// Search with no lower bound.
pub const NO_LOWER_BOUND: u64 = 0;
/// Search with no upper bound.
pub const NO_UPPER_BOUND: u64 = i64::MAX as u64;

/// Default sample retention window.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);
/// Default number of shard workers.
pub const DEFAULT_WORKER_COUNT: usize = 128;
/// Default per-shard inbox capacity. Bigger inboxes smooth bursty producers
/// at the cost of end-to-end latency when a shard saturates.
pub const DEFAULT_INBOX_CAPACITY: usize = 512;

/// Callback invoked for every evicted sample, on the owning shard's worker.
/// Must be fast and non-blocking; suitable for downsampling or handing
/// expiring data to persistent storage.
pub type ExpiryHandler = Arc<dyn Fn(&str, &Sample) + Send + Sync>;

/// Engine construction options.
#[derive(Clone)]
pub struct Options {
    /// Samples older than this are discarded by the expiry pass.
    pub max_age: Duration,
    /// Number of shards, each with its own worker task.
    pub worker_count: usize,
    /// Bounded inbox size per shard; writers block when it fills.
    pub inbox_capacity: usize,
    /// Optional eviction hook.
    pub on_expire: Option<ExpiryHandler>,
    /// Counts offered writes; incremented before enqueue. Discards by default.
    pub message_counter: Counter,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            worker_count: DEFAULT_WORKER_COUNT,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            on_expire: None,
            message_counter: Counter::noop(),
        }
    }
}

impl Options {
    /// Read options from the environment, falling back to defaults.
    ///
    /// - `TIDEPOOL_MAX_AGE_SECS`: retention window in seconds
    /// - `TIDEPOOL_WORKER_COUNT`: number of shards
    /// - `TIDEPOOL_INBOX_CAPACITY`: per-shard inbox size
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_age: env_parse("TIDEPOOL_MAX_AGE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_age),
            worker_count: env_parse("TIDEPOOL_WORKER_COUNT").unwrap_or(defaults.worker_count),
            inbox_capacity: env_parse("TIDEPOOL_INBOX_CAPACITY")
                .unwrap_or(defaults.inbox_capacity),
            ..defaults
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_inbox_capacity(mut self, inbox_capacity: usize) -> Self {
        self.inbox_capacity = inbox_capacity;
        self
    }

    pub fn with_expiry_handler(mut self, handler: ExpiryHandler) -> Self {
        self.on_expire = Some(handler);
        self
    }

    pub fn with_message_counter(mut self, counter: Counter) -> Self {
        self.message_counter = counter;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("key '{key}' does not exist")]
    NotFound { key: String },

    #[error("search arguments are not valid")]
    InvalidSearch,

    #[error("engine is closed")]
    Closed,
}

/// Sharded in-memory time-series cache.
///
/// Keys are partitioned across worker tasks by stable hash; each worker
/// exclusively owns its slice of the keyspace, so operations on one shard
/// serialize through its inbox instead of contending on locks. Writes are
/// fire-and-forget up to inbox capacity; searches await a reply on a private
/// channel.
pub struct Engine {
    inboxes: Vec<mpsc::Sender<Task>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    opts: Arc<Options>,
}

impl Engine {
    /// Spawn one worker per shard and start their expiry tickers.
    pub fn new(opts: Options) -> Self {
        let shard_count = opts.worker_count.max(1);
        let opts = Arc::new(opts);
        let (shutdown, _) = watch::channel(false);
        let mut inboxes = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);

        for shard_id in 0..shard_count {
            let (inbox_tx, inbox_rx) = mpsc::channel(opts.inbox_capacity.max(1));
            inboxes.push(inbox_tx);
            workers.push(tokio::spawn(shard::run(
                shard_id,
                inbox_rx,
                shutdown.subscribe(),
                Arc::clone(&opts),
            )));
        }

        Self {
            inboxes,
            shutdown,
            workers: Mutex::new(workers),
            opts,
        }
    }

    /// Append a sample to the key's series.
    ///
    /// Counts the message, then enqueues on the owning shard. Blocks only
    /// while that shard's inbox is full (backpressure); never drops. Fails
    /// with [`EngineError::Closed`] once the engine has shut down.
    pub async fn write(
        &self,
        key: &str,
        timestamp_ns: i64,
        payload: Bytes,
    ) -> Result<(), EngineError> {
        self.opts.message_counter.increment(1);
        let task = Task::Write {
            key: key.to_string(),
            sample: Sample::new(timestamp_ns, payload),
        };
        self.inbox(key)
            .send(task)
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Samples for `key` with timestamps in `[oldest, newest)`.
    ///
    /// Bounds are nanoseconds since the Unix epoch; [`NO_LOWER_BOUND`] and
    /// [`NO_UPPER_BOUND`] leave an end open. Returns
    /// [`EngineError::InvalidSearch`] when `oldest > newest` and
    /// [`EngineError::NotFound`] when the key has no live series.
    pub async fn search(
        &self,
        key: &str,
        oldest: u64,
        newest: u64,
    ) -> Result<Vec<Sample>, EngineError> {
        if oldest > newest {
            return Err(EngineError::InvalidSearch);
        }

        let (reply, response) = oneshot::channel();
        let task = Task::Search {
            key: key.to_string(),
            first: oldest,
            last: newest,
            reply,
        };
        self.inbox(key)
            .send(task)
            .await
            .map_err(|_| EngineError::Closed)?;

        // A dropped reply sender means the worker exited mid-query.
        match response.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Closed),
        }
    }

    /// Every key currently live, across all shards.
    pub async fn keys(&self) -> Result<Vec<String>, EngineError> {
        let mut keys = Vec::new();
        for inbox in &self.inboxes {
            let (reply, response) = oneshot::channel();
            inbox
                .send(Task::Keys { reply })
                .await
                .map_err(|_| EngineError::Closed)?;
            keys.extend(response.await.map_err(|_| EngineError::Closed)?);
        }
        Ok(keys)
    }

    pub fn shard_count(&self) -> usize {
        self.inboxes.len()
    }

    pub fn max_age(&self) -> Duration {
        self.opts.max_age
    }

    /// Signal shutdown and join every shard worker.
    ///
    /// Workers finish their in-flight task but abandon the inbox backlog;
    /// searches caught in the backlog observe [`EngineError::Closed`] rather
    /// than blocking forever. Subsequent writes and searches are rejected.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(error = %err, "shard worker exited abnormally");
            }
        }
    }

    fn inbox(&self, key: &str) -> &mpsc::Sender<Task> {
        &self.inboxes[router::shard_index(key, self.inboxes.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // from_env tests mutate shared process env; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: [&str; 3] = [
        "TIDEPOOL_MAX_AGE_SECS",
        "TIDEPOOL_WORKER_COUNT",
        "TIDEPOOL_INBOX_CAPACITY",
    ];

    #[test]
    fn test_options_from_env_defaults() {
        let _guard = ENV_LOCK.lock();
        for name in ENV_VARS {
            std::env::remove_var(name);
        }

        let opts = Options::from_env();
        assert_eq!(opts.max_age, DEFAULT_MAX_AGE);
        assert_eq!(opts.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(opts.inbox_capacity, DEFAULT_INBOX_CAPACITY);
    }

    #[test]
    fn test_options_from_env_overrides() {
        let _guard = ENV_LOCK.lock();
        std::env::set_var("TIDEPOOL_MAX_AGE_SECS", "120");
        std::env::set_var("TIDEPOOL_WORKER_COUNT", "8");
        std::env::set_var("TIDEPOOL_INBOX_CAPACITY", "32");

        let opts = Options::from_env();
        for name in ENV_VARS {
            std::env::remove_var(name);
        }

        assert_eq!(opts.max_age, Duration::from_secs(120));
        assert_eq!(opts.worker_count, 8);
        assert_eq!(opts.inbox_capacity, 32);
    }

    fn small_engine() -> Engine {
        Engine::new(
            Options::default()
                .with_worker_count(4)
                .with_inbox_capacity(16),
        )
    }

    fn timestamps(samples: &[Sample]) -> Vec<i64> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[tokio::test]
    async fn test_write_then_search() {
        let engine = small_engine();
        for ts in [100, 110, 120] {
            engine.write("k", ts, Bytes::new()).await.unwrap();
        }

        let found = engine
            .search("k", NO_LOWER_BOUND, NO_UPPER_BOUND)
            .await
            .unwrap();
        assert_eq!(timestamps(&found), vec![100, 110, 120]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_out_of_order_writes_absorbed() {
        let engine = small_engine();
        for ts in [130, 120, 110, 100] {
            engine.write("k", ts, Bytes::new()).await.unwrap();
        }

        let found = engine
            .search("k", NO_LOWER_BOUND, NO_UPPER_BOUND)
            .await
            .unwrap();
        assert_eq!(timestamps(&found), vec![100, 110, 120, 130]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_arrival_order() {
        let engine = small_engine();
        engine.write("k", 130, Bytes::from_static(b"x")).await.unwrap();
        engine.write("k", 130, Bytes::from_static(b"y")).await.unwrap();
        engine.write("k", 120, Bytes::new()).await.unwrap();

        let found = engine
            .search("k", NO_LOWER_BOUND, NO_UPPER_BOUND)
            .await
            .unwrap();
        assert_eq!(timestamps(&found), vec![120, 130, 130]);
        assert_eq!(found[1].payload, Bytes::from_static(b"x"));
        assert_eq!(found[2].payload, Bytes::from_static(b"y"));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_search_half_open_bounds() {
        let engine = small_engine();
        for ts in [100, 110, 120, 130, 130] {
            engine.write("k", ts, Bytes::new()).await.unwrap();
        }

        let found = engine.search("k", 110, 130).await.unwrap();
        assert_eq!(timestamps(&found), vec![110, 120]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_search_invalid_bounds() {
        let engine = small_engine();
        engine.write("k", 120, Bytes::new()).await.unwrap();

        let result = engine.search("k", 130, 110).await;
        assert!(matches!(result, Err(EngineError::InvalidSearch)));

        // no side effects, the series is intact
        let found = engine
            .search("k", NO_LOWER_BOUND, NO_UPPER_BOUND)
            .await
            .unwrap();
        assert_eq!(timestamps(&found), vec![120]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_search_unknown_key() {
        let engine = small_engine();

        let result = engine.search("nope", NO_LOWER_BOUND, NO_UPPER_BOUND).await;
        assert!(matches!(result, Err(EngineError::NotFound { key }) if key == "nope"));

        engine.close().await;
    }

    #[tokio::test]
    async fn test_key_isolation() {
        let engine = small_engine();
        engine.write("a", 100, Bytes::from_static(b"a")).await.unwrap();
        engine.write("b", 200, Bytes::from_static(b"b")).await.unwrap();

        let found = engine
            .search("a", NO_LOWER_BOUND, NO_UPPER_BOUND)
            .await
            .unwrap();
        assert_eq!(timestamps(&found), vec![100]);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_keys_spans_shards() {
        let engine = small_engine();
        let mut expected = Vec::new();
        for i in 0..20 {
            let key = format!("key-{}", i);
            engine.write(&key, 100 + i, Bytes::new()).await.unwrap();
            expected.push(key);
        }

        let mut keys = engine.keys().await.unwrap();
        keys.sort();
        expected.sort();
        assert_eq!(keys, expected);

        engine.close().await;
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let engine = small_engine();
        engine.write("k", 100, Bytes::new()).await.unwrap();
        engine.close().await;

        assert!(matches!(
            engine.write("k", 110, Bytes::new()).await,
            Err(EngineError::Closed)
        ));
        assert!(matches!(
            engine.search("k", NO_LOWER_BOUND, NO_UPPER_BOUND).await,
            Err(EngineError::Closed)
        ));
        assert!(matches!(engine.keys().await, Err(EngineError::Closed)));
    }

    #[tokio::test]
    async fn test_backpressure_never_drops() {
        // A tiny inbox forces writers to wait on the saturated shard; every
        // offered sample must still land.
        let engine = Engine::new(
            Options::default()
                .with_worker_count(1)
                .with_inbox_capacity(2),
        );

        for i in 0..2000 {
            engine.write("k", i, Bytes::new()).await.unwrap();
        }

        let found = engine
            .search("k", NO_LOWER_BOUND, NO_UPPER_BOUND)
            .await
            .unwrap();
        assert_eq!(found.len(), 2000);

        engine.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_writers_and_readers() {
        let engine = Arc::new(Engine::new(
            Options::default()
                .with_worker_count(10)
                .with_inbox_capacity(100),
        ));
        let base = chrono::Utc::now().timestamp_nanos_opt().unwrap();

        let mut tasks = Vec::new();
        for writer in 0..100u32 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                let key = format!("writer-{}", writer);
                for i in 0..100u32 {
                    // scattered offsets exercise out-of-order absorption
                    let jitter = ((i * 31 + writer * 7) % 100) as i64;
                    engine.write(&key, base + jitter, Bytes::new()).await.unwrap();
                }
            }));
        }
        for _ in 0..100 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let keys = engine.keys().await.unwrap();
                    for key in keys {
                        let _ = engine.search(&key, NO_LOWER_BOUND, NO_UPPER_BOUND).await;
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for writer in [0, 13, 42, 99] {
            let key = format!("writer-{}", writer);
            let found = engine
                .search(&key, NO_LOWER_BOUND, NO_UPPER_BOUND)
                .await
                .unwrap();
            assert_eq!(found.len(), 100, "key {}", key);
            assert!(
                found.windows(2).all(|w| w[0].timestamp <= w[1].timestamp),
                "key {} is not sorted",
                key
            );
        }

        engine.close().await;
    }
}
