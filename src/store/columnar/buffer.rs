use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use super::accumulator::Accumulator;
use crate::model::{AggregationKey, ErrorCategory, OutcomeRecord};

/// Thread-safe accumulation buffer keyed by aggregation key.
///
/// Uses `DashMap` so concurrent producers only contend on the shard holding their key.
pub struct Buffer {
    /// When this buffer started accumulating.
    pub start_time: Instant,
    rows: DashMap<AggregationKey, Accumulator>,
    outcomes: AtomicUsize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rows: DashMap::with_capacity(64),
            outcomes: AtomicUsize::new(0),
        }
    }

    /// Records one outcome under `key`.
    pub fn record(&self, key: AggregationKey, record: &OutcomeRecord, category: Option<ErrorCategory>) {
        self.rows.entry(key).or_default().record(record, category);
        self.outcomes.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds an already-reduced accumulator in (used to re-buffer a batch that failed to flush).
    pub fn merge(&self, key: AggregationKey, acc: &Accumulator) {
        self.rows.entry(key).or_default().merge(acc);
        self.outcomes.fetch_add(acc.total as usize, Ordering::Relaxed);
    }

    /// Number of outcomes recorded.
    pub fn outcomes(&self) -> usize {
        self.outcomes.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Copies the current accumulators without draining them.
    pub fn snapshot(&self) -> Vec<(AggregationKey, Accumulator)> {
        self.rows
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Consumes the buffer's rows, sorted by key.
    pub fn into_rows(self) -> Vec<(AggregationKey, Accumulator)> {
        let mut rows: Vec<_> = self.rows.into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Holder swapping whole buffers at flush time.
///
/// Producers load the current buffer lock-free; a flush swaps in an empty one and waits for
/// in-flight producers to drop their handle on the old buffer before draining it.
pub struct AtomicBuffer {
    inner: ArcSwap<Buffer>,
}

impl AtomicBuffer {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Buffer::new()),
        }
    }

    /// Loads the current buffer.
    pub fn load(&self) -> Arc<Buffer> {
        self.inner.load_full()
    }

    /// Swaps in an empty buffer and returns the previous one once no producer holds it.
    pub fn rotate(&self) -> Buffer {
        let mut old = self.inner.swap(Arc::new(Buffer::new()));
        loop {
            match Arc::try_unwrap(old) {
                Ok(buf) => return buf,
                Err(shared) => {
                    old = shared;
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl Default for AtomicBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolReliability;

    fn key(task: &str) -> AggregationKey {
        AggregationKey {
            model: "m".into(),
            prompt_variant: "baseline".into(),
            tool_reliability: ToolReliability::FULL,
            difficulty: "easy".into(),
            task_type: task.into(),
        }
    }

    fn success() -> OutcomeRecord {
        OutcomeRecord {
            model: "m".into(),
            success: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_record_groups_by_key() {
        let buf = Buffer::new();
        buf.record(key("a"), &success(), None);
        buf.record(key("a"), &success(), None);
        buf.record(key("b"), &success(), None);

        assert_eq!(buf.outcomes(), 3);
        let rows = buf.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0.task_type, "a");
        assert_eq!(rows[0].1.total, 2);
    }

    #[test]
    fn test_rotate_returns_previous_contents() {
        let holder = AtomicBuffer::new();
        holder.load().record(key("a"), &success(), None);

        let old = holder.rotate();
        assert_eq!(old.outcomes(), 1);
        assert!(holder.load().is_empty());
        assert_eq!(holder.load().outcomes(), 0);
    }

    #[test]
    fn test_concurrent_record_and_rotate_loses_nothing() {
        let holder = Arc::new(AtomicBuffer::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let holder = Arc::clone(&holder);
            handles.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    holder.load().record(key("a"), &success(), None);
                }
            }));
        }

        let mut drained = 0u64;
        for _ in 0..10 {
            drained += holder.rotate().into_rows().iter().map(|r| r.1.total).sum::<u64>();
        }
        for h in handles {
            h.join().expect("producer thread");
        }
        drained += holder.rotate().into_rows().iter().map(|r| r.1.total).sum::<u64>();

        assert_eq!(drained, 1000);
    }
}
