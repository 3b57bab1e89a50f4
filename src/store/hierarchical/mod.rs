//! Hierarchical backend: one JSON document keyed model → variant → reliability →
//! difficulty → task type, persisted with merge-before-overwrite.

mod document;

pub use document::{
    DifficultyEntry, ModelEntry, ReliabilityEntry, StoreDocument, Summary, VariantEntry,
    DOCUMENT_VERSION,
};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{FlushReport, KeyedStats, OutcomeReducer, StatsQuery};
use crate::error::Result;
use crate::export::StoreMetrics;
use crate::lock::{self, Loaded, LockOptions};
use crate::model::{AggregationKey, OutcomeRecord};

struct State {
    doc: StoreDocument,
    dirty: BTreeSet<AggregationKey>,
    pending: usize,
}

pub struct HierarchicalStore {
    path: PathBuf,
    lock: LockOptions,
    reducer: OutcomeReducer,
    metrics: Arc<StoreMetrics>,
    state: Mutex<State>,
}

impl HierarchicalStore {
    /// Loads the current document under its lock. A corrupt file is moved aside and the
    /// store starts empty.
    pub fn open(
        path: &Path,
        lock: LockOptions,
        reducer: OutcomeReducer,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Self> {
        let loaded = lock::read_json_safe::<StoreDocument>(path, &lock)?;
        let doc = into_document(loaded, &metrics);

        info!(
            path = %path.display(),
            models = doc.models.len(),
            total_tests = doc.summary.total_tests,
            "hierarchical store opened",
        );

        Ok(Self {
            path: path.to_path_buf(),
            lock,
            reducer,
            metrics,
            state: Mutex::new(State {
                doc,
                dirty: BTreeSet::new(),
                pending: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn apply_outcome(&self, record: &OutcomeRecord) -> Result<AggregationKey> {
        let (key, category) = self.reducer.reduce(record)?;

        let mut state = self.state.lock();
        state.doc.record(&key, record, category, Utc::now());
        state.dirty.insert(key.clone());
        state.pending += 1;

        Ok(key)
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// Merges dirty keys into the on-disk document inside the file lock and writes it back.
    ///
    /// On failure dirty marks are kept so the next persist retries.
    pub fn persist(&self) -> Result<FlushReport> {
        let mut state = self.state.lock();
        if state.dirty.is_empty() {
            return Ok(FlushReport::default());
        }

        let merged = lock::with_lock(&self.path, &self.lock, || {
            let mut disk = into_document(lock::load_json(&self.path)?, &self.metrics);
            disk.merge_dirty(&state.doc, &state.dirty, Utc::now());
            lock::write_json_atomic(&self.path, &disk)?;
            Ok(disk)
        })?;

        let report = FlushReport {
            keys: state.dirty.len(),
            outcomes: state.pending,
        };
        state.doc = merged;
        state.dirty.clear();
        state.pending = 0;

        debug!(
            path = %self.path.display(),
            keys = report.keys,
            outcomes = report.outcomes,
            "hierarchical store persisted",
        );

        Ok(report)
    }

    /// Matching leaves over the document a persist would write right now.
    pub fn query(&self, query: &StatsQuery) -> Result<Vec<KeyedStats>> {
        let query = query.clone().normalized(self.reducer.normalizer());

        // Only the dirty nodes of this model are needed from local state.
        let local = {
            let state = self.state.lock();
            let dirty: Vec<AggregationKey> = state
                .dirty
                .iter()
                .filter(|k| query.matches(k))
                .cloned()
                .collect();
            let mut local = StoreDocument::empty();
            let now = Utc::now();
            for key in &dirty {
                if let Some(node) = state.doc.node(key) {
                    *local.node_mut(key, now) = node.clone();
                }
            }
            (local, dirty)
        };

        let loaded = lock::read_json_safe::<StoreDocument>(&self.path, &self.lock)?;
        let mut view = into_document(loaded, &self.metrics);
        view.merge_dirty(&local.0, &local.1, Utc::now());

        Ok(view
            .leaves()
            .into_iter()
            .filter(|(key, _)| query.matches(key))
            .map(|(key, stats)| KeyedStats {
                key,
                stats: stats.clone(),
            })
            .collect())
    }

    /// Snapshot of the in-memory document as of the last open or persist plus local changes.
    pub fn snapshot(&self) -> StoreDocument {
        self.state.lock().doc.clone()
    }
}

fn into_document(loaded: Loaded<StoreDocument>, metrics: &StoreMetrics) -> StoreDocument {
    match loaded {
        Loaded::Present(doc) => doc,
        Loaded::Missing => StoreDocument::empty(),
        Loaded::Quarantined(_) => {
            metrics.corrupt_quarantines.inc();
            StoreDocument::empty()
        }
    }
}
