//! The handle evaluation workers record outcomes through.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collector::{Collector, ProcessInfo};
use crate::config::{Config, IngestMode, StorePaths};
use crate::error::Result;
use crate::export::StoreMetrics;
use crate::flush::{FlushPolicy, FlushScheduler, FlushTarget};
use crate::model::OutcomeRecord;
use crate::store::{Backend, FlushReport, KeyedStats, OutcomeReducer, Progress, StatsQuery};

/// Shared result store handle. Cheap to clone; all clones share one buffer.
///
/// Outcomes are reduced in memory and written out when [`FlushPolicy`] says so, on
/// [`ResultStore::flush`], and on [`ResultStore::finalize`]. Dropping the last handle without
/// finalizing still flushes, but errors are only logged.
///
/// That drop-time flush takes the store lock and may wait out its backoff. Inside a
/// multi-threaded tokio runtime it runs under [`tokio::task::block_in_place`]; on a
/// current-thread runtime it blocks the runtime thread, so call [`ResultStore::finalize`]
/// from `spawn_blocking` there instead of relying on drop.
#[derive(Clone)]
pub struct ResultStore {
    inner: Arc<Inner>,
}

struct Inner {
    paths: StorePaths,
    backend: Backend,
    reducer: OutcomeReducer,
    metrics: Arc<StoreMetrics>,
    ingest: Ingest,
    policy: FlushPolicy,
    last_flush: Mutex<Instant>,
    scheduler: Mutex<Option<FlushScheduler>>,
    finalized: AtomicBool,
}

enum Ingest {
    /// Outcomes go straight into the backend.
    Direct,
    /// Outcomes are buffered per model and handed to the merger as staging files.
    Staged(StagedBuffer),
}

struct StagedBuffer {
    collector: Collector,
    info: ProcessInfo,
    by_model: Mutex<BTreeMap<String, Vec<OutcomeRecord>>>,
    pending: AtomicUsize,
}

impl ResultStore {
    /// Opens the store described by `cfg`.
    ///
    /// When called inside a tokio runtime a [`FlushScheduler`] is started for time-based
    /// flushes; otherwise flushes happen inline from [`ResultStore::add_outcome`].
    pub fn open(cfg: Config) -> anyhow::Result<Self> {
        cfg.validate().context("validating config")?;

        let metrics = Arc::new(StoreMetrics::new().context("creating store metrics")?);
        let reducer = OutcomeReducer::from_config(&cfg).context("building outcome reducer")?;
        let backend = Backend::open(&cfg, reducer.clone(), Arc::clone(&metrics))
            .with_context(|| format!("opening {} store", cfg.backend.as_str()))?;

        let paths = cfg.paths();
        let ingest = match cfg.mode {
            IngestMode::Direct => Ingest::Direct,
            IngestMode::Staged => Ingest::Staged(StagedBuffer {
                collector: Collector::new(&paths.staging_dir, Arc::clone(&metrics)),
                info: ProcessInfo {
                    started_at: Some(chrono::Utc::now()),
                    ..ProcessInfo::current()
                },
                by_model: Mutex::new(BTreeMap::new()),
                pending: AtomicUsize::new(0),
            }),
        };

        let inner = Arc::new(Inner {
            paths,
            backend,
            reducer,
            metrics,
            ingest,
            policy: FlushPolicy::from(&cfg.flush),
            last_flush: Mutex::new(Instant::now()),
            scheduler: Mutex::new(None),
            finalized: AtomicBool::new(false),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let scheduler = FlushScheduler::start(&runtime, inner.policy, Arc::downgrade(&inner));
            *inner.scheduler.lock() = Some(scheduler);
        }

        info!(
            data_dir = %inner.paths.root.display(),
            backend = inner.backend.name(),
            mode = ?cfg.mode,
            max_pending = inner.policy.max_pending,
            interval = ?inner.policy.interval,
            scheduled = inner.scheduler.lock().is_some(),
            "result store opened",
        );

        Ok(Self { inner })
    }

    /// Records one outcome. Returns `false` if it was rejected; the caller may retry just that
    /// record. Never fails a batch.
    pub fn add_outcome(&self, record: &OutcomeRecord) -> bool {
        let inner = &self.inner;
        if inner.finalized.load(Ordering::SeqCst) {
            inner.metrics.outcomes_rejected.inc();
            warn!(test_id = %record.test_id, "outcome added after finalize, rejected");
            return false;
        }

        let accepted = match &inner.ingest {
            Ingest::Direct => inner.backend.apply_outcome(record).map(|_| ()),
            Ingest::Staged(staged) => inner.reducer.reduce(record).map(|(key, _)| {
                // Counted under the map lock so a concurrent flush never takes a record
                // before it is counted.
                let mut by_model = staged.by_model.lock();
                by_model.entry(key.model).or_default().push(record.clone());
                staged.pending.fetch_add(1, Ordering::SeqCst);
            }),
        };

        if let Err(e) = accepted {
            inner.metrics.outcomes_rejected.inc();
            warn!(test_id = %record.test_id, model = %record.model, error = %e, "outcome rejected");
            return false;
        }
        inner.metrics.outcomes_added.inc();

        let pending = inner.pending();
        inner.metrics.pending_outcomes.set(pending as f64);
        let scheduled = match inner.scheduler.lock().as_ref() {
            // The scheduler's own ticker covers the interval trigger.
            Some(scheduler) => {
                if inner.policy.count_reached(pending) {
                    scheduler.wake();
                }
                true
            }
            None => false,
        };
        if !scheduled && inner.policy.is_due(pending, inner.last_flush.lock().elapsed()) {
            if let Err(e) = inner.flush_pending() {
                warn!(error = %e, pending, "inline flush failed, outcomes kept buffered");
            }
        }

        true
    }

    /// Writes buffered outcomes out now.
    pub fn flush(&self) -> Result<FlushReport> {
        self.inner.flush_pending()
    }

    /// Stops the scheduler, flushes, and writes the metrics textfile. Idempotent; outcomes
    /// added afterwards are rejected.
    pub fn finalize(&self) -> Result<FlushReport> {
        self.inner.finalize()
    }

    /// Every leaf matching `query` over persisted and unflushed state, sorted by key.
    pub fn query_stats(&self, query: &StatsQuery) -> Result<Vec<KeyedStats>> {
        let mut stats = self.inner.backend.query(query)?;
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stats)
    }

    /// How many tests `model` has recorded against `target`.
    pub fn check_progress(&self, model: &str, target: u64) -> Result<Progress> {
        let stats = self.query_stats(&StatsQuery::model(model))?;
        Ok(Progress::from_stats(&stats, target))
    }

    /// Outcomes accepted but not yet written out.
    pub fn pending(&self) -> usize {
        self.inner.pending()
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    pub fn paths(&self) -> &StorePaths {
        &self.inner.paths
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.inner.metrics
    }
}

impl Inner {
    fn finalize(&self) -> Result<FlushReport> {
        let first = !self.finalized.swap(true, Ordering::SeqCst);
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }

        let report = self.flush_pending()?;

        if first {
            if let Err(e) = self.metrics.write_textfile(&self.paths.metrics_dir) {
                warn!(error = %e, "failed to write metrics textfile");
            }
            info!(
                backend = self.backend.name(),
                keys = report.keys,
                outcomes = report.outcomes,
                "result store finalized",
            );
        }
        Ok(report)
    }

    fn flush_staged(&self, staged: &StagedBuffer) -> Result<FlushReport> {
        let batches = std::mem::take(&mut *staged.by_model.lock());
        let mut report = FlushReport::default();
        let mut remaining = batches.into_iter();

        while let Some((model, records)) = remaining.next() {
            match staged.collector.submit_batch(&model, &records, &staged.info) {
                Ok(_) => {
                    staged.pending.fetch_sub(records.len(), Ordering::SeqCst);
                    report.keys += 1;
                    report.outcomes += records.len();
                }
                Err(e) => {
                    self.metrics
                        .flush_failures
                        .with_label_values(&["staged"])
                        .inc();
                    let mut buffer = staged.by_model.lock();
                    for (model, records) in std::iter::once((model, records)).chain(remaining) {
                        buffer.entry(model).or_default().extend(records);
                    }
                    return Err(e);
                }
            }
        }

        if report.keys > 0 {
            self.metrics.flushes.with_label_values(&["staged"]).inc();
        }
        debug!(files = report.keys, outcomes = report.outcomes, "staged outcomes submitted");
        Ok(report)
    }
}

impl FlushTarget for Inner {
    fn pending(&self) -> usize {
        match &self.ingest {
            Ingest::Direct => self.backend.pending(),
            Ingest::Staged(staged) => staged.pending.load(Ordering::SeqCst),
        }
    }

    fn flush_pending(&self) -> Result<FlushReport> {
        let result = match &self.ingest {
            Ingest::Direct => self.backend.flush(),
            Ingest::Staged(staged) => self.flush_staged(staged),
        };
        if result.is_ok() {
            *self.last_flush.lock() = Instant::now();
        }
        self.metrics.pending_outcomes.set(self.pending() as f64);
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.finalized.load(Ordering::SeqCst) && self.pending() == 0 {
            return;
        }
        let in_worker = tokio::runtime::Handle::try_current()
            .map(|h| h.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread)
            .unwrap_or(false);
        let result = if in_worker {
            tokio::task::block_in_place(|| self.finalize())
        } else {
            self.finalize()
        };
        if let Err(e) = result {
            warn!(error = %e, pending = self.pending(), "finalize on drop failed");
        }
    }
}
