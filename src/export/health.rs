use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "evalstore";

/// Prometheus metrics for store health.
///
/// All metrics use the "evalstore" namespace. There is no HTTP endpoint: the registry is
/// written as a textfile (node-exporter textfile collector convention) on finalize and after
/// each merge cycle.
pub struct StoreMetrics {
    registry: Registry,

    // === Ingest ===
    /// Outcomes accepted by `add_outcome`.
    pub outcomes_added: Counter,
    /// Outcomes rejected by `add_outcome`.
    pub outcomes_rejected: Counter,
    /// Outcomes buffered in this process and not yet flushed.
    pub pending_outcomes: Gauge,

    // === Flush ===
    /// Successful flushes by backend.
    pub flushes: CounterVec,
    /// Failed flushes by backend.
    pub flush_failures: CounterVec,
    /// Flush duration by backend (1ms-10s buckets).
    pub flush_duration: HistogramVec,
    /// Keys written by flushes, by backend.
    pub keys_flushed: CounterVec,
    /// Lock acquisitions that timed out.
    pub lock_timeouts: Counter,
    /// Corrupt store files moved aside.
    pub corrupt_quarantines: Counter,

    // === Columnar maintenance ===
    /// Batches spilled to recovery files.
    pub recovery_spills: Counter,
    /// Recovery files folded back into the table.
    pub recovery_replays: Counter,
    /// Incremental side files written.
    pub incremental_files_written: Counter,
    /// Incremental side files folded into the table.
    pub incremental_files_consolidated: Counter,

    // === Staging ===
    /// Staging files written by producers.
    pub staging_files_written: Counter,
    /// Staging files ingested by the merger.
    pub staging_files_ingested: Counter,
    /// Staging files skipped as vanished or malformed.
    pub staging_files_skipped: CounterVec,
    /// Staging files removed by the retention sweep.
    pub staging_files_swept: Counter,
    /// Completed merge cycles.
    pub merge_cycles: Counter,
}

impl StoreMetrics {
    /// Creates a new metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let outcomes_added = Counter::with_opts(
            Opts::new("outcomes_added_total", "Outcomes accepted by add_outcome.")
                .namespace(NAMESPACE),
        )?;
        let outcomes_rejected = Counter::with_opts(
            Opts::new("outcomes_rejected_total", "Outcomes rejected by add_outcome.")
                .namespace(NAMESPACE),
        )?;
        let pending_outcomes = Gauge::with_opts(
            Opts::new(
                "pending_outcomes",
                "Outcomes buffered in this process and not yet flushed.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Flush ===
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Successful flushes by backend.").namespace(NAMESPACE),
            &["backend"],
        )?;
        let flush_failures = CounterVec::new(
            Opts::new("flush_failures_total", "Failed flushes by backend.").namespace(NAMESPACE),
            &["backend"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Flush duration by backend.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["backend"],
        )?;
        let keys_flushed = CounterVec::new(
            Opts::new("keys_flushed_total", "Keys written by flushes, by backend.")
                .namespace(NAMESPACE),
            &["backend"],
        )?;
        let lock_timeouts = Counter::with_opts(
            Opts::new("lock_timeouts_total", "Lock acquisitions that timed out.")
                .namespace(NAMESPACE),
        )?;
        let corrupt_quarantines = Counter::with_opts(
            Opts::new(
                "corrupt_quarantines_total",
                "Corrupt store files renamed aside.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Columnar maintenance ===
        let recovery_spills = Counter::with_opts(
            Opts::new("recovery_spills_total", "Batches spilled to recovery files.")
                .namespace(NAMESPACE),
        )?;
        let recovery_replays = Counter::with_opts(
            Opts::new(
                "recovery_replays_total",
                "Recovery files folded back into the table.",
            )
            .namespace(NAMESPACE),
        )?;
        let incremental_files_written = Counter::with_opts(
            Opts::new(
                "incremental_files_written_total",
                "Incremental side files written.",
            )
            .namespace(NAMESPACE),
        )?;
        let incremental_files_consolidated = Counter::with_opts(
            Opts::new(
                "incremental_files_consolidated_total",
                "Incremental side files folded into the table.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Staging ===
        let staging_files_written = Counter::with_opts(
            Opts::new("staging_files_written_total", "Staging files written.")
                .namespace(NAMESPACE),
        )?;
        let staging_files_ingested = Counter::with_opts(
            Opts::new(
                "staging_files_ingested_total",
                "Staging files ingested by the merger.",
            )
            .namespace(NAMESPACE),
        )?;
        let staging_files_skipped = CounterVec::new(
            Opts::new(
                "staging_files_skipped_total",
                "Staging files skipped by reason (vanished/malformed).",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let staging_files_swept = Counter::with_opts(
            Opts::new(
                "staging_files_swept_total",
                "Staging files removed by the retention sweep.",
            )
            .namespace(NAMESPACE),
        )?;
        let merge_cycles = Counter::with_opts(
            Opts::new("merge_cycles_total", "Completed merge cycles.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(outcomes_added.clone()))?;
        registry.register(Box::new(outcomes_rejected.clone()))?;
        registry.register(Box::new(pending_outcomes.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(keys_flushed.clone()))?;
        registry.register(Box::new(lock_timeouts.clone()))?;
        registry.register(Box::new(corrupt_quarantines.clone()))?;
        registry.register(Box::new(recovery_spills.clone()))?;
        registry.register(Box::new(recovery_replays.clone()))?;
        registry.register(Box::new(incremental_files_written.clone()))?;
        registry.register(Box::new(incremental_files_consolidated.clone()))?;
        registry.register(Box::new(staging_files_written.clone()))?;
        registry.register(Box::new(staging_files_ingested.clone()))?;
        registry.register(Box::new(staging_files_skipped.clone()))?;
        registry.register(Box::new(staging_files_swept.clone()))?;
        registry.register(Box::new(merge_cycles.clone()))?;

        Ok(Self {
            registry,
            outcomes_added,
            outcomes_rejected,
            pending_outcomes,
            flushes,
            flush_failures,
            flush_duration,
            keys_flushed,
            lock_timeouts,
            corrupt_quarantines,
            recovery_spills,
            recovery_replays,
            incremental_files_written,
            incremental_files_consolidated,
            staging_files_written,
            staging_files_ingested,
            staging_files_skipped,
            staging_files_swept,
            merge_cycles,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Atomically writes `<dir>/<pid>.prom`.
    pub fn write_textfile(&self, dir: &Path) -> Result<PathBuf> {
        let text = self.encode()?;
        let path = dir.join(format!("{}.prom", std::process::id()));
        crate::lock::write_atomic(&path, text.as_bytes())
            .with_context(|| format!("writing metrics textfile {}", path.display()))?;

        tracing::debug!(path = %path.display(), "metrics textfile written");

        Ok(path)
    }
}
