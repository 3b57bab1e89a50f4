//! Columnar backend: per-process accumulators flushed into one shared column-major table
//! by additive merge.
//!
//! In incremental mode flushes write producer-private side files instead of taking the table
//! lock, and consolidation later folds them in. A flush that cannot reach the table spills its
//! batch to a recovery file that the next open replays. Folded side files are recorded in the
//! table before they are deleted, so a crash between the two never counts a file twice.

pub mod accumulator;
pub mod buffer;
pub mod row;
pub mod side;
pub mod table;

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use self::accumulator::Accumulator;
use self::buffer::AtomicBuffer;
use self::row::SummaryRow;
use self::side::SideKind;
use self::table::Table;
use super::{FlushReport, KeyedStats, OutcomeReducer, StatsQuery};
use crate::config::{ColumnarConfig, StorePaths};
use crate::error::{Result, StoreError};
use crate::export::StoreMetrics;
use crate::lock::{self, Loaded, LockOptions};
use crate::model::{AggregationKey, OutcomeRecord};

/// Result of folding side files into the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldReport {
    /// Files merged into the table by this call.
    pub folded: usize,
    /// Files already recorded as merged, deleted without merging again.
    pub stale: usize,
    /// Files that failed to parse and were moved aside.
    pub quarantined: usize,
}

pub struct ColumnarStore {
    path: PathBuf,
    incremental_dir: PathBuf,
    recovery_dir: PathBuf,
    cfg: ColumnarConfig,
    lock: LockOptions,
    reducer: OutcomeReducer,
    metrics: Arc<StoreMetrics>,
    buffer: AtomicBuffer,
    side_files_written: AtomicUsize,
    flush_serial: Mutex<()>,
}

impl ColumnarStore {
    /// Opens the store and replays any recovery files left by failed flushes.
    pub fn open(
        paths: &StorePaths,
        cfg: &ColumnarConfig,
        lock: LockOptions,
        reducer: OutcomeReducer,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Self> {
        let store = Self {
            path: paths.columnar.clone(),
            incremental_dir: paths.incremental_dir.clone(),
            recovery_dir: paths.recovery_dir.clone(),
            cfg: cfg.clone(),
            lock,
            reducer,
            metrics,
            buffer: AtomicBuffer::new(),
            side_files_written: AtomicUsize::new(0),
            flush_serial: Mutex::new(()),
        };

        let replayed = store.replay_recovery()?;
        info!(
            path = %store.path.display(),
            incremental = store.cfg.incremental,
            recovery_files_replayed = replayed.folded,
            "columnar store opened",
        );

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn apply_outcome(&self, record: &OutcomeRecord) -> Result<AggregationKey> {
        let (key, category) = self.reducer.reduce(record)?;
        self.buffer.load().record(key.clone(), record, category);
        Ok(key)
    }

    pub fn pending(&self) -> usize {
        self.buffer.load().outcomes()
    }

    /// Drains the buffer into the shared table, or into a side file in incremental mode.
    ///
    /// If the write fails the batch is spilled to a recovery file and
    /// [`StoreError::PartialFlush`] is returned. If even the spill fails, the batch goes back
    /// into the buffer.
    pub fn flush(&self) -> Result<FlushReport> {
        let _serial = self.flush_serial.lock();

        let drained = self.buffer.rotate();
        if drained.is_empty() {
            return Ok(FlushReport::default());
        }
        let outcomes = drained.outcomes();
        let rows = drained.into_rows();

        let now = Utc::now();
        let batch = Table::from_rows(
            rows.iter()
                .map(|(key, acc)| SummaryRow::from_accumulator(key.clone(), acc, now)),
        );
        let report = FlushReport {
            keys: batch.len(),
            outcomes,
        };

        let written = if self.cfg.incremental {
            self.write_incremental(&batch)
        } else {
            self.merge_into_table(batch.clone())
        };

        if let Err(source) = written {
            return Err(self.spill(batch, rows, source));
        }

        debug!(
            path = %self.path.display(),
            keys = report.keys,
            outcomes = report.outcomes,
            incremental = self.cfg.incremental,
            "columnar batch flushed",
        );

        if self.cfg.incremental
            && self.cfg.consolidate_after_files > 0
            && self.side_files_written.load(Ordering::Relaxed) >= self.cfg.consolidate_after_files
        {
            if let Err(e) = self.consolidate() {
                warn!(error = %e, "consolidation after flush failed, will retry");
            }
        }

        Ok(report)
    }

    /// Folds every incremental side file into the table.
    pub fn consolidate(&self) -> Result<FoldReport> {
        let report = self.fold(SideKind::Incremental)?;
        self.side_files_written.store(0, Ordering::Relaxed);
        self.metrics
            .incremental_files_consolidated
            .inc_by(report.folded as f64);
        if report.folded > 0 || report.stale > 0 {
            info!(
                folded = report.folded,
                stale = report.stale,
                quarantined = report.quarantined,
                "incremental files consolidated",
            );
        }
        Ok(report)
    }

    /// Folds every recovery file into the table.
    pub fn replay_recovery(&self) -> Result<FoldReport> {
        let report = self.fold(SideKind::Recovery)?;
        self.metrics.recovery_replays.inc_by(report.folded as f64);
        if report.folded > 0 || report.stale > 0 {
            info!(
                folded = report.folded,
                stale = report.stale,
                quarantined = report.quarantined,
                "recovery files replayed",
            );
        }
        Ok(report)
    }

    /// Current shared table, read under its lock.
    pub fn table(&self) -> Result<Table> {
        let loaded = lock::read_json_safe::<Table>(&self.path, &self.lock)?;
        Ok(self.into_table(loaded))
    }

    /// Matching rows over the shared table, unconsolidated side files and the local buffer,
    /// combined additively.
    pub fn query(&self, query: &StatsQuery) -> Result<Vec<KeyedStats>> {
        let query = query.clone().normalized(self.reducer.normalizer());
        let mut view = self.table()?;

        for kind in [SideKind::Incremental, SideKind::Recovery] {
            let dir = self.side_dir(kind);
            for path in side::list(dir, kind)? {
                if view.is_ingested(&side::file_name(&path)) {
                    continue;
                }
                if let Loaded::Present(side_table) = lock::load_json::<Table>(&path)? {
                    view.merge_table(side_table);
                }
            }
        }

        let now = Utc::now();
        for (key, acc) in self.buffer.load().snapshot() {
            view.merge_row(SummaryRow::from_accumulator(key, &acc, now));
        }

        Ok(view
            .rows()
            .filter(|row| query.matches(&row.key))
            .map(|row| KeyedStats {
                key: row.key.clone(),
                stats: row.stats.clone(),
            })
            .collect())
    }

    fn side_dir(&self, kind: SideKind) -> &Path {
        match kind {
            SideKind::Incremental => &self.incremental_dir,
            SideKind::Recovery => &self.recovery_dir,
        }
    }

    fn merge_into_table(&self, batch: Table) -> Result<()> {
        lock::with_lock(&self.path, &self.lock, || {
            let mut table = self.into_table(lock::load_json(&self.path)?);
            table.merge_table(batch);
            lock::write_json_atomic(&self.path, &table)
        })
    }

    fn write_incremental(&self, batch: &Table) -> Result<()> {
        let side_table = with_producer(batch.clone());
        let path = side::write(&self.incremental_dir, SideKind::Incremental, &side_table)?;
        self.side_files_written.fetch_add(1, Ordering::Relaxed);
        self.metrics.incremental_files_written.inc();
        debug!(path = %path.display(), rows = side_table.len(), "incremental file written");
        Ok(())
    }

    fn spill(
        &self,
        batch: Table,
        rows: Vec<(AggregationKey, Accumulator)>,
        source: StoreError,
    ) -> StoreError {
        let row_count = batch.len();
        match side::write(&self.recovery_dir, SideKind::Recovery, &with_producer(batch)) {
            Ok(spilled_to) => {
                self.metrics.recovery_spills.inc();
                error!(
                    error = %source,
                    rows = row_count,
                    spilled_to = %spilled_to.display(),
                    "flush failed, batch spilled to recovery file",
                );
                StoreError::PartialFlush {
                    rows: row_count,
                    spilled_to,
                    source: Box::new(source),
                }
            }
            Err(spill_err) => {
                let current = self.buffer.load();
                for (key, acc) in &rows {
                    current.merge(key.clone(), acc);
                }
                error!(
                    error = %source,
                    spill_error = %spill_err,
                    rows = row_count,
                    "flush and recovery spill failed, batch kept in memory",
                );
                source
            }
        }
    }

    /// Folds side files of `kind` into the table inside one critical section, then deletes
    /// them.
    fn fold(&self, kind: SideKind) -> Result<FoldReport> {
        let dir = self.side_dir(kind);
        let files = side::list(dir, kind)?;
        if files.is_empty() {
            return Ok(FoldReport::default());
        }
        let present: BTreeSet<String> = files.iter().map(|p| side::file_name(p)).collect();

        let (report, done) = lock::with_lock(&self.path, &self.lock, || {
            let mut table = self.into_table(lock::load_json(&self.path)?);
            table.retain_ingested(|name| !name.starts_with(kind.prefix()) || present.contains(name));

            let mut report = FoldReport::default();
            let mut done = Vec::new();
            for path in &files {
                let name = side::file_name(path);
                if table.is_ingested(&name) {
                    report.stale += 1;
                    done.push(path.clone());
                    continue;
                }
                match lock::load_json::<Table>(path)? {
                    Loaded::Present(side_table) => {
                        table.merge_table(side_table);
                        table.mark_ingested(name);
                        report.folded += 1;
                        done.push(path.clone());
                    }
                    Loaded::Missing => {}
                    Loaded::Quarantined(_) => {
                        self.metrics.corrupt_quarantines.inc();
                        report.quarantined += 1;
                    }
                }
            }

            if report.folded > 0 {
                lock::write_json_atomic(&self.path, &table)?;
            }
            Ok((report, done))
        })?;

        for path in done {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove folded side file");
                }
            }
        }

        Ok(report)
    }

    fn into_table(&self, loaded: Loaded<Table>) -> Table {
        match loaded {
            Loaded::Present(table) => table,
            Loaded::Missing => Table::new(),
            Loaded::Quarantined(_) => {
                self.metrics.corrupt_quarantines.inc();
                Table::new()
            }
        }
    }
}

fn with_producer(batch: Table) -> Table {
    let pid = std::process::id();
    Table::from_rows(batch.into_rows().map(|row| row.with_producer(pid)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::ToolReliability;

    fn open_with(root: &Path, incremental: bool) -> ColumnarStore {
        let paths = StorePaths::new(root);
        let cfg = ColumnarConfig {
            incremental,
            consolidate_after_files: 100,
        };
        ColumnarStore::open(
            &paths,
            &cfg,
            LockOptions::default(),
            OutcomeReducer::from_config(&Config::default()).expect("reducer"),
            Arc::new(StoreMetrics::new().expect("metrics")),
        )
        .expect("open")
    }

    fn outcome(success: bool, duration: f64) -> OutcomeRecord {
        OutcomeRecord {
            model: "modelX".into(),
            prompt_variant: "baseline".into(),
            tool_reliability: 0.8,
            difficulty: "medium".into(),
            task_type: "file_ops".into(),
            success,
            duration_secs: duration,
            tool_calls: 1,
            ..Default::default()
        }
    }

    fn key() -> AggregationKey {
        AggregationKey {
            model: "modelX".into(),
            prompt_variant: "baseline".into(),
            tool_reliability: ToolReliability::from_f64(0.8),
            difficulty: "medium".into(),
            task_type: "file_ops".into(),
        }
    }

    #[test]
    fn test_two_flushes_add_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_with(dir.path(), false);

        for _ in 0..3 {
            store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        }
        assert_eq!(store.pending(), 3);
        store.flush().expect("flush 1");
        assert_eq!(store.pending(), 0);

        store.apply_outcome(&outcome(false, 5.0)).expect("apply");
        store.flush().expect("flush 2");

        let table = store.table().expect("table");
        let row = table.get(&key()).expect("row");
        assert_eq!(row.stats.total, 4);
        assert_eq!(row.stats.success, 3);
        assert_eq!(row.stats.failed, 1);
        assert!((row.stats.success_rate - 0.75).abs() < 1e-9);
        assert!((row.stats.means.avg_duration - 2.0).abs() < 1e-9);
        assert!(row.producer_pid.is_none());
    }

    #[test]
    fn test_two_processes_same_key_are_summed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = open_with(dir.path(), false);
        let b = open_with(dir.path(), false);

        a.apply_outcome(&outcome(true, 1.0)).expect("apply");
        a.apply_outcome(&outcome(true, 1.0)).expect("apply");
        b.apply_outcome(&outcome(false, 4.0)).expect("apply");

        a.flush().expect("flush a");
        b.flush().expect("flush b");

        let row = a.table().expect("table").get(&key()).cloned().expect("row");
        assert_eq!(row.stats.total, 3);
        assert!((row.stats.means.avg_duration - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_incremental_then_consolidate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_with(dir.path(), true);

        store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        store.flush().expect("flush");
        store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        store.flush().expect("flush");

        assert!(!store.path().exists());
        let side_files = side::list(&dir.path().join("incremental"), SideKind::Incremental)
            .expect("list");
        assert_eq!(side_files.len(), 2);

        // Queries see unconsolidated side files.
        let stats = store.query(&StatsQuery::model("modelX")).expect("query");
        assert_eq!(stats[0].stats.total, 2);

        let report = store.consolidate().expect("consolidate");
        assert_eq!(report.folded, 2);
        assert_eq!(store.table().expect("table").get(&key()).map(|r| r.stats.total), Some(2));
        assert!(side::list(&dir.path().join("incremental"), SideKind::Incremental)
            .expect("list")
            .is_empty());

        // Consolidating again changes nothing.
        assert_eq!(store.consolidate().expect("again"), FoldReport::default());
        assert_eq!(store.table().expect("table").get(&key()).map(|r| r.stats.total), Some(2));
    }

    #[test]
    fn test_ingested_side_file_is_not_counted_twice() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_with(dir.path(), true);
        store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        store.flush().expect("flush");

        let incremental = dir.path().join("incremental");
        let file = side::list(&incremental, SideKind::Incremental).expect("list")[0].clone();
        let copy = std::fs::read(&file).expect("read side file");

        store.consolidate().expect("consolidate");
        // Simulate a crash between the table write and the delete.
        std::fs::write(&file, copy).expect("restore side file");

        let report = store.consolidate().expect("consolidate again");
        assert_eq!(report.stale, 1);
        assert_eq!(report.folded, 0);
        assert!(!file.exists());
        assert_eq!(store.table().expect("table").get(&key()).map(|r| r.stats.total), Some(1));
    }

    #[test]
    fn test_failed_flush_spills_and_replays_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = StorePaths::new(dir.path());
        let fast = LockOptions {
            timeout: std::time::Duration::from_millis(50),
            retry_interval: std::time::Duration::from_millis(5),
            max_retry_interval: std::time::Duration::from_millis(10),
            ..LockOptions::default()
        };
        let store = ColumnarStore::open(
            &paths,
            &ColumnarConfig::default(),
            fast.clone(),
            OutcomeReducer::from_config(&Config::default()).expect("reducer"),
            Arc::new(StoreMetrics::new().expect("metrics")),
        )
        .expect("open");
        store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        store.apply_outcome(&outcome(false, 1.0)).expect("apply");

        let held = lock::acquire(&paths.columnar, &fast).expect("hold table lock");
        let err = store.flush().expect_err("flush must fail");
        drop(held);

        match &err {
            StoreError::PartialFlush { rows, spilled_to, .. } => {
                assert_eq!(*rows, 1);
                assert!(spilled_to.exists());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_lock_timeout());
        assert_eq!(store.pending(), 0);

        let reopened = open_with(dir.path(), false);
        let row = reopened.table().expect("table").get(&key()).cloned().expect("row");
        assert_eq!(row.stats.total, 2);
        assert!(side::list(&paths.recovery_dir, SideKind::Recovery)
            .expect("list")
            .is_empty());
    }

    #[test]
    fn test_query_merges_buffer_with_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open_with(dir.path(), false);
        store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        store.flush().expect("flush");
        store.apply_outcome(&outcome(false, 3.0)).expect("apply");

        let stats = store
            .query(&StatsQuery::model("modelX").difficulty("medium"))
            .expect("query");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].stats.total, 2);
        assert!((stats[0].stats.means.avg_duration - 2.0).abs() < 1e-9);

        assert!(store
            .query(&StatsQuery::model("modelX").difficulty("hard"))
            .expect("query")
            .is_empty());
    }

    #[test]
    fn test_corrupt_table_is_quarantined() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("summary.json"), b"[1, 2").expect("write");
        let store = open_with(dir.path(), false);
        store.apply_outcome(&outcome(true, 1.0)).expect("apply");
        store.flush().expect("flush");
        assert_eq!(store.table().expect("table").len(), 1);
    }
}
