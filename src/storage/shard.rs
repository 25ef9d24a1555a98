use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use super::engine::{EngineError, ExpiryHandler, Options};
use super::series::{Sample, Series};

/// How often each worker runs its age-based eviction pass. Independent of the
/// retention window; the pass tolerates imprecise scheduling because series
/// are sorted and eviction is idempotent.
const EXPIRATION_FREQUENCY: Duration = Duration::from_secs(5);

/// Unit of work crossing a shard inbox.
///
/// A sealed set of variants rather than arbitrary closures, so the worker
/// protocol stays auditable. Reply channels travel inside the task.
pub(crate) enum Task {
    /// Insert one sample into the key's series, creating it if absent.
    Write { key: String, sample: Sample },
    /// Range-scan `[first, last)` over the key's series.
    Search {
        key: String,
        first: u64,
        last: u64,
        reply: oneshot::Sender<Result<Vec<Sample>, EngineError>>,
    },
    /// Enumerate the keys currently live on this shard.
    Keys { reply: oneshot::Sender<Vec<String>> },
}

/// Shard worker event loop.
///
/// Exclusively owns this shard's key map; every mutation and read happens
/// here, one event per iteration, so the map needs no locks. The select is
/// unbiased: sustained inbox traffic cannot starve the expiry tick, and
/// shutdown interrupts after the in-flight task rather than after the
/// backlog.
pub(crate) async fn run(
    shard: usize,
    mut inbox: mpsc::Receiver<Task>,
    mut shutdown: watch::Receiver<bool>,
    opts: Arc<Options>,
) {
    let mut data: HashMap<String, Series> = HashMap::new();
    let mut ticker = tokio::time::interval(EXPIRATION_FREQUENCY);
    tracing::debug!(shard, "shard worker started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            task = inbox.recv() => match task {
                Some(task) => apply(task, &mut data),
                None => break,
            },
            _ = ticker.tick() => {
                let cutoff = now_nanos() - opts.max_age.as_nanos() as i64;
                expire(&mut data, cutoff, opts.on_expire.as_ref());
            }
        }
    }

    tracing::debug!(shard, keys = data.len(), "shard worker stopped");
}

fn apply(task: Task, data: &mut HashMap<String, Series>) {
    match task {
        Task::Write { key, sample } => {
            data.entry(key).or_default().insert(sample);
        }
        Task::Search {
            key,
            first,
            last,
            reply,
        } => {
            let result = match data.get(&key) {
                Some(series) => Ok(series.range(first as i64, last as i64)),
                None => Err(EngineError::NotFound { key }),
            };
            // A dropped receiver means the caller gave up; nothing to do.
            let _ = reply.send(result);
        }
        Task::Keys { reply } => {
            let _ = reply.send(data.keys().cloned().collect());
        }
    }
}

/// One eviction pass: front-expire every series against `cutoff`, then drop
/// the keys whose series emptied. A panicking callback is logged and the
/// worker carries on.
fn expire(data: &mut HashMap<String, Series>, cutoff: i64, on_expire: Option<&ExpiryHandler>) {
    let mut empties = Vec::new();
    let mut evicted = 0usize;

    for (key, series) in data.iter_mut() {
        evicted += series.expire_before(cutoff, |sample| {
            if let Some(handler) = on_expire {
                if catch_unwind(AssertUnwindSafe(|| handler(key, sample))).is_err() {
                    tracing::warn!(key = %key, "eviction callback panicked");
                }
            }
        });
        if series.is_empty() {
            empties.push(key.clone());
        }
    }

    for key in &empties {
        data.remove(key);
    }

    if evicted > 0 {
        tracing::debug!(evicted, reaped = empties.len(), "expiry pass");
    }
}

fn now_nanos() -> i64 {
    // timestamp_nanos_opt only fails past the year 2262
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
