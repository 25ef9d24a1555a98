use bytes::Bytes;
use std::collections::VecDeque;

/// A single timestamped observation under a key.
///
/// The payload is opaque to the engine. `Bytes` handles share the underlying
/// buffer, so cloning a sample into a query result never copies payload data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Opaque payload, stored by reference.
    pub payload: Bytes,
}

impl Sample {
    pub fn new(timestamp: i64, payload: Bytes) -> Self {
        Self { timestamp, payload }
    }
}

/// The time-ordered samples under a single key.
///
/// Non-decreasing by timestamp at every observable moment. Equal timestamps
/// are kept in arrival order. Insertion scans from the tail because the
/// common case is an in-order append; late arrivals walk backwards only as
/// far as they need to.
#[derive(Debug, Default)]
pub struct Series {
    samples: VecDeque<Sample>,
}

impl Series {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Insert a sample, preserving non-decreasing timestamp order.
    ///
    /// The new sample lands immediately after the last existing sample whose
    /// timestamp is `<=` its own, so ties keep arrival order. If every
    /// existing timestamp is strictly greater it becomes the new front.
    pub fn insert(&mut self, sample: Sample) {
        for i in (0..self.samples.len()).rev() {
            if self.samples[i].timestamp <= sample.timestamp {
                self.samples.insert(i + 1, sample);
                return;
            }
        }
        self.samples.push_front(sample);
    }

    /// Samples with `first <= timestamp < last`, oldest first.
    ///
    /// Returns a fresh snapshot; callers may keep or mutate it without
    /// holding anything alive inside the series.
    pub fn range(&self, first: i64, last: i64) -> Vec<Sample> {
        let (front, back) = match (self.samples.front(), self.samples.back()) {
            (Some(front), Some(back)) => (front, back),
            _ => return Vec::new(),
        };
        if back.timestamp < first || front.timestamp >= last {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(self.samples.len());
        for sample in &self.samples {
            if sample.timestamp >= first && sample.timestamp < last {
                result.push(sample.clone());
            }
        }
        result
    }

    /// Remove samples older than `cutoff` from the front, stopping at the
    /// first survivor. `evicted` sees each removed sample before it is
    /// discarded. Returns the number of samples removed.
    pub fn expire_before(&mut self, cutoff: i64, mut evicted: impl FnMut(&Sample)) -> usize {
        let mut removed = 0;
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.timestamp < cutoff)
        {
            if let Some(sample) = self.samples.pop_front() {
                evicted(&sample);
                removed += 1;
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }
}
