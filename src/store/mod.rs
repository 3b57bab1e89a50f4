//! Storage backends.
//!
//! Both backends reduce outcomes with the same [`OutcomeReducer`] and expose the same
//! operations through [`Backend`], which is resolved once from configuration.

pub mod columnar;
pub mod hierarchical;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::classify::Classifier;
use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::export::StoreMetrics;
use crate::lock::LockOptions;
use crate::model::{AggregationKey, ErrorCategory, ModelNormalizer, OutcomeRecord, StatisticsNode, ToolReliability};

use self::columnar::ColumnarStore;
use self::hierarchical::HierarchicalStore;

/// Turns a raw outcome into the key it is counted under and its error category.
#[derive(Debug, Clone)]
pub struct OutcomeReducer {
    normalizer: ModelNormalizer,
    classifier: Classifier,
}

impl OutcomeReducer {
    pub fn new(normalizer: ModelNormalizer, classifier: Classifier) -> Self {
        Self {
            normalizer,
            classifier,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self::new(
            ModelNormalizer::new(&cfg.normalization)?,
            Classifier::new(&cfg.classification),
        ))
    }

    pub fn reduce(&self, record: &OutcomeRecord) -> Result<(AggregationKey, Option<ErrorCategory>)> {
        record.validate()?;
        let key = AggregationKey::from_outcome(record, &self.normalizer)?;
        Ok((key, self.classifier.category_for(record)))
    }

    pub fn normalizer(&self) -> &ModelNormalizer {
        &self.normalizer
    }
}

/// Filter over aggregation keys. `None` dimensions match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsQuery {
    pub model: String,
    pub prompt_variant: Option<String>,
    pub tool_reliability: Option<ToolReliability>,
    pub difficulty: Option<String>,
    pub task_type: Option<String>,
}

impl StatsQuery {
    pub fn model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn prompt_variant(mut self, variant: impl Into<String>) -> Self {
        self.prompt_variant = Some(variant.into());
        self
    }

    pub fn tool_reliability(mut self, rate: f64) -> Self {
        self.tool_reliability = Some(ToolReliability::from_f64(rate));
        self
    }

    pub fn difficulty(mut self, difficulty: impl Into<String>) -> Self {
        self.difficulty = Some(difficulty.into());
        self
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Canonicalizes the model name the same way outcomes are keyed.
    pub fn normalized(mut self, normalizer: &ModelNormalizer) -> Self {
        self.model = normalizer.normalize(&self.model);
        self
    }

    pub fn matches(&self, key: &AggregationKey) -> bool {
        key.model == self.model
            && self.prompt_variant.as_ref().is_none_or(|v| *v == key.prompt_variant)
            && self.tool_reliability.is_none_or(|r| r == key.tool_reliability)
            && self.difficulty.as_ref().is_none_or(|d| *d == key.difficulty)
            && self.task_type.as_ref().is_none_or(|t| *t == key.task_type)
    }
}

/// One matching leaf of a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyedStats {
    pub key: AggregationKey,
    pub stats: StatisticsNode,
}

/// Progress of a model towards a target number of tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u64,
    pub target: u64,
    pub remaining: u64,
}

impl Progress {
    pub fn from_stats(stats: &[KeyedStats], target: u64) -> Self {
        let current = stats.iter().map(|s| s.stats.total).sum::<u64>();
        Self {
            current,
            target,
            remaining: target.saturating_sub(current),
        }
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Distinct keys written.
    pub keys: usize,
    /// Outcomes covered by those keys.
    pub outcomes: usize,
}

/// The backend chosen at startup.
///
/// Uses enum dispatch; the set of backends is closed and known at compile time.
pub enum Backend {
    Hierarchical(HierarchicalStore),
    Columnar(ColumnarStore),
}

impl Backend {
    /// Opens the configured backend and logs the resolution once.
    pub fn open(cfg: &Config, reducer: OutcomeReducer, metrics: Arc<StoreMetrics>) -> Result<Self> {
        let paths = cfg.paths();
        let lock = LockOptions::from(&cfg.lock);

        let backend = match cfg.backend {
            BackendKind::Hierarchical => Self::Hierarchical(HierarchicalStore::open(
                &paths.hierarchical,
                lock,
                reducer,
                metrics,
            )?),
            BackendKind::Columnar => Self::Columnar(ColumnarStore::open(
                &paths,
                &cfg.columnar,
                lock,
                reducer,
                metrics,
            )?),
        };

        info!(
            backend = backend.name(),
            path = %backend.path().display(),
            "store backend resolved",
        );

        Ok(backend)
    }

    /// Returns the backend name for logging and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hierarchical(_) => BackendKind::Hierarchical.as_str(),
            Self::Columnar(_) => BackendKind::Columnar.as_str(),
        }
    }

    /// Path of the shared store file.
    pub fn path(&self) -> &Path {
        match self {
            Self::Hierarchical(s) => s.path(),
            Self::Columnar(s) => s.path(),
        }
    }

    /// Reduces one outcome into process-local state. No I/O.
    pub fn apply_outcome(&self, record: &OutcomeRecord) -> Result<AggregationKey> {
        match self {
            Self::Hierarchical(s) => s.apply_outcome(record),
            Self::Columnar(s) => s.apply_outcome(record),
        }
    }

    /// Outcomes applied since the last successful flush.
    pub fn pending(&self) -> usize {
        match self {
            Self::Hierarchical(s) => s.pending(),
            Self::Columnar(s) => s.pending(),
        }
    }

    /// Writes process-local state into the shared store.
    pub fn flush(&self) -> Result<FlushReport> {
        let metrics = self.metrics();
        let name = self.name();
        let start = Instant::now();

        let result = match self {
            Self::Hierarchical(s) => s.persist(),
            Self::Columnar(s) => s.flush(),
        };

        match &result {
            Ok(report) => {
                metrics.flushes.with_label_values(&[name]).inc();
                metrics
                    .keys_flushed
                    .with_label_values(&[name])
                    .inc_by(report.keys as f64);
                metrics
                    .flush_duration
                    .with_label_values(&[name])
                    .observe(start.elapsed().as_secs_f64());
            }
            Err(e) => {
                metrics.flush_failures.with_label_values(&[name]).inc();
                if e.is_lock_timeout() {
                    metrics.lock_timeouts.inc();
                }
                warn!(backend = name, error = %e, "flush failed");
            }
        }
        metrics.pending_outcomes.set(self.pending() as f64);

        result
    }

    /// Every leaf matching `query`, over persisted state plus unflushed local state.
    pub fn query(&self, query: &StatsQuery) -> Result<Vec<KeyedStats>> {
        match self {
            Self::Hierarchical(s) => s.query(query),
            Self::Columnar(s) => s.query(query),
        }
    }

    /// Folds batches spilled by earlier failed flushes back into the store. Returns the number
    /// of files folded; the hierarchical backend never spills.
    pub fn recover(&self) -> Result<usize> {
        match self {
            Self::Hierarchical(_) => Ok(0),
            Self::Columnar(s) => s.replay_recovery().map(|r| r.folded),
        }
    }

    fn metrics(&self) -> &StoreMetrics {
        match self {
            Self::Hierarchical(s) => s.metrics(),
            Self::Columnar(s) => s.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(variant: &str, difficulty: &str) -> AggregationKey {
        AggregationKey {
            model: "m".into(),
            prompt_variant: variant.into(),
            tool_reliability: ToolReliability::from_f64(0.8),
            difficulty: difficulty.into(),
            task_type: "search".into(),
        }
    }

    #[test]
    fn test_query_matching() {
        let q = StatsQuery::model("m");
        assert!(q.matches(&key("baseline", "easy")));

        let q = StatsQuery::model("m").prompt_variant("concise").tool_reliability(0.8);
        assert!(q.matches(&key("concise", "hard")));
        assert!(!q.matches(&key("baseline", "hard")));

        let q = StatsQuery::model("m").tool_reliability(0.9);
        assert!(!q.matches(&key("baseline", "easy")));

        assert!(!StatsQuery::model("other").matches(&key("baseline", "easy")));
    }

    #[test]
    fn test_progress_saturates() {
        let mut stats = StatisticsNode::default();
        stats.total = 12;
        let leaves = vec![KeyedStats {
            key: key("baseline", "easy"),
            stats,
        }];
        assert_eq!(
            Progress::from_stats(&leaves, 10),
            Progress {
                current: 12,
                target: 10,
                remaining: 0
            }
        );
        assert_eq!(Progress::from_stats(&[], 5).remaining, 5);
    }

    #[test]
    fn test_reducer_rejects_invalid_records() {
        let mut cfg = Config::default();
        cfg.normalization.known_models = vec!["modelX".into()];
        let reducer = OutcomeReducer::from_config(&cfg).expect("reducer");
        assert!(reducer.reduce(&OutcomeRecord::default()).is_err());

        let (key, category) = reducer
            .reduce(&OutcomeRecord {
                model: "modelX-2".into(),
                error: Some("request timed out".into()),
                ..Default::default()
            })
            .expect("reduce");
        assert_eq!(key.model, "modelX");
        assert_eq!(category, Some(ErrorCategory::Timeout));
    }
}
