use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{list_staging, StagingFile};
use crate::config::{MergerConfig, StorePaths};
use crate::error::{Result, StoreError};
use crate::export::StoreMetrics;
use crate::lock::LeaderLock;
use crate::store::Backend;

/// Counts from one merge cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Staging files ingested and deleted.
    pub ingested: usize,
    /// Files that disappeared between listing and reading.
    pub vanished: usize,
    /// Files that failed to parse and were left in place.
    pub malformed: usize,
    /// Outcomes applied to the backend.
    pub outcomes: usize,
    /// Outcomes the backend rejected.
    pub rejected: usize,
    /// Keys written by the closing flush.
    pub keys_flushed: usize,
}

/// Singleton consumer of staging files.
///
/// Holds the merger leader lock for its whole lifetime, so at most one merger ingests a given
/// store at a time.
pub struct Merger {
    paths: StorePaths,
    cfg: MergerConfig,
    backend: Backend,
    metrics: Arc<StoreMetrics>,
    malformed: Mutex<HashSet<PathBuf>>,
    leader: LeaderLock,
}

impl Merger {
    /// Becomes the merger for the store at `paths`. Returns `None` if another merger holds the
    /// leader lock.
    pub fn try_elect(
        paths: &StorePaths,
        cfg: &MergerConfig,
        backend: Backend,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Option<Self>> {
        let Some(leader) = LeaderLock::try_acquire(&paths.merger_lock)? else {
            return Ok(None);
        };

        info!(
            staging_dir = %paths.staging_dir.display(),
            backend = backend.name(),
            poll_interval = ?cfg.poll_interval,
            retention = ?cfg.retention,
            "merger elected",
        );

        Ok(Some(Self {
            paths: paths.clone(),
            cfg: cfg.clone(),
            backend,
            metrics,
            malformed: Mutex::new(HashSet::new()),
            leader,
        }))
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Ingests every staging file currently present, then flushes the backend.
    ///
    /// Ingested files are deleted before the flush: a crash in between loses that batch rather
    /// than counting it twice.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        match self.backend.recover() {
            Ok(0) => {}
            Ok(folded) => info!(folded, "merger replayed recovery files"),
            Err(e) => warn!(error = %e, "recovery replay failed, will retry next cycle"),
        }

        let listed = list_staging(&self.paths.staging_dir)?;
        self.ingest(listed)
    }

    /// Ingests a listed set of staging files. Files gone by the time they are read were
    /// taken by someone else and are counted as vanished.
    fn ingest(&self, listed: Vec<PathBuf>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let mut by_model: BTreeMap<String, Vec<(PathBuf, StagingFile)>> = BTreeMap::new();
        for path in listed {
            if self.malformed.lock().contains(&path) {
                continue;
            }
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.vanished += 1;
                    self.metrics
                        .staging_files_skipped
                        .with_label_values(&["vanished"])
                        .inc();
                    debug!(path = %path.display(), "staging file vanished before ingest");
                    continue;
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            match serde_json::from_slice::<StagingFile>(&bytes) {
                Ok(staged) => by_model
                    .entry(staged.model.clone())
                    .or_default()
                    .push((path, staged)),
                Err(e) => {
                    report.malformed += 1;
                    self.metrics
                        .staging_files_skipped
                        .with_label_values(&["malformed"])
                        .inc();
                    warn!(path = %path.display(), error = %e, "malformed staging file left in place");
                    self.malformed.lock().insert(path);
                }
            }
        }

        let mut ingested = Vec::new();
        for (model, files) in by_model {
            let mut outcomes = 0usize;
            for (path, staged) in files {
                for record in &staged.results {
                    match self.backend.apply_outcome(record) {
                        Ok(_) => outcomes += 1,
                        Err(e) => {
                            report.rejected += 1;
                            warn!(
                                path = %path.display(),
                                test_id = %record.test_id,
                                error = %e,
                                "staged outcome rejected",
                            );
                        }
                    }
                }
                ingested.push(path);
            }
            debug!(model = %model, outcomes, "staged outcomes applied");
            report.outcomes += outcomes;
        }

        for path in &ingested {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to delete ingested staging file"),
            }
        }
        report.ingested = ingested.len();
        self.metrics
            .staging_files_ingested
            .inc_by(report.ingested as f64);

        if self.backend.pending() > 0 {
            report.keys_flushed = self.backend.flush()?.keys;
        }

        self.metrics.merge_cycles.inc();
        if let Err(e) = self.metrics.write_textfile(&self.paths.metrics_dir) {
            warn!(error = %e, "failed to write metrics textfile");
        }

        if report.ingested > 0 || report.malformed > 0 || report.vanished > 0 {
            info!(
                ingested = report.ingested,
                outcomes = report.outcomes,
                rejected = report.rejected,
                malformed = report.malformed,
                vanished = report.vanished,
                keys_flushed = report.keys_flushed,
                "merge cycle completed",
            );
        }

        Ok(report)
    }

    /// Deletes staging files, including malformed and orphaned temp files, older than the
    /// retention window.
    pub fn sweep(&self) -> Result<usize> {
        let dir = &self.paths.staging_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let now = SystemTime::now();
        let mut swept = 0usize;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .unwrap_or(Duration::ZERO);
            if age < self.cfg.retention {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    swept += 1;
                    self.malformed.lock().remove(&path);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to sweep staging file"),
            }
        }

        if swept > 0 {
            self.metrics.staging_files_swept.inc_by(swept as f64);
            info!(swept, retention = ?self.cfg.retention, "expired staging files swept");
        }
        Ok(swept)
    }

    /// Runs merge cycles every `poll_interval` and sweeps every `sweep_interval` until
    /// `cancel` fires, then runs one final cycle.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep_ticker = tokio::time::interval(self.cfg.sweep_interval);
        sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(lock = %self.leader.lock_path().display(), "merger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.spawn_cycle().await;
                    info!("merger stopped");
                    break;
                }
                _ = ticker.tick() => {
                    self.spawn_cycle().await;
                }
                _ = sweep_ticker.tick() => {
                    let merger = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || merger.sweep()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "staging sweep failed"),
                        Err(e) => error!(error = %e, "staging sweep task panicked"),
                    }
                }
            }
        }
    }

    async fn spawn_cycle(self: &Arc<Self>) {
        let merger = Arc::clone(self);
        match tokio::task::spawn_blocking(move || merger.run_cycle()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "merge cycle failed, will retry"),
            Err(e) => error!(error = %e, "merge cycle task panicked"),
        }
    }
}
