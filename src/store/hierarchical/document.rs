use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{AggregationKey, ErrorCategory, OutcomeRecord, StatisticsNode, ToolReliability};

pub const DOCUMENT_VERSION: u32 = 1;

/// The shared hierarchical statistics file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
    #[serde(default)]
    pub summary: Summary,
}

fn default_version() -> u32 {
    DOCUMENT_VERSION
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelEntry {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub total_tests: u64,
    #[serde(default)]
    pub by_prompt_variant: BTreeMap<String, VariantEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantEntry {
    #[serde(default)]
    pub by_tool_reliability: BTreeMap<String, ReliabilityEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReliabilityEntry {
    #[serde(default)]
    pub by_difficulty: BTreeMap<String, DifficultyEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyEntry {
    #[serde(default)]
    pub by_task_type: BTreeMap<String, StatisticsNode>,
}

/// Store-wide totals, recomputed on every persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    #[serde(default)]
    pub total_tests: u64,
    #[serde(default)]
    pub total_success: u64,
    #[serde(default)]
    pub total_partial: u64,
    #[serde(default)]
    pub total_failure: u64,
    #[serde(default)]
    pub models_tested: Vec<String>,
}

impl StoreDocument {
    pub fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            last_updated: Utc::now(),
            ..Default::default()
        }
    }

    pub fn node(&self, key: &AggregationKey) -> Option<&StatisticsNode> {
        self.models
            .get(&key.model)?
            .by_prompt_variant
            .get(&key.prompt_variant)?
            .by_tool_reliability
            .get(&key.tool_reliability.as_key())?
            .by_difficulty
            .get(&key.difficulty)?
            .by_task_type
            .get(&key.task_type)
    }

    /// Resolves the node for `key`, creating the path (and the model entry) as needed.
    pub fn node_mut(&mut self, key: &AggregationKey, now: DateTime<Utc>) -> &mut StatisticsNode {
        let model = self.models.entry(key.model.clone()).or_insert_with(|| ModelEntry {
            first_seen: now,
            last_seen: now,
            ..Default::default()
        });
        model.last_seen = model.last_seen.max(now);

        model
            .by_prompt_variant
            .entry(key.prompt_variant.clone())
            .or_default()
            .by_tool_reliability
            .entry(key.tool_reliability.as_key())
            .or_default()
            .by_difficulty
            .entry(key.difficulty.clone())
            .or_default()
            .by_task_type
            .entry(key.task_type.clone())
            .or_default()
    }

    /// Folds one outcome into the node for `key`.
    pub fn record(
        &mut self,
        key: &AggregationKey,
        record: &OutcomeRecord,
        category: Option<ErrorCategory>,
        now: DateTime<Utc>,
    ) {
        self.node_mut(key, now).apply(record, category);
    }

    /// Every leaf with its key, in key order.
    pub fn leaves(&self) -> Vec<(AggregationKey, &StatisticsNode)> {
        let mut out = Vec::new();
        for (model, entry) in &self.models {
            for (variant, v) in &entry.by_prompt_variant {
                for (rate, r) in &v.by_tool_reliability {
                    let Some(tool_reliability) = ToolReliability::parse(rate) else {
                        warn!(model = %model, rate = %rate, "skipping unparseable tool reliability key");
                        continue;
                    };
                    for (difficulty, d) in &r.by_difficulty {
                        for (task_type, node) in &d.by_task_type {
                            out.push((
                                AggregationKey {
                                    model: model.clone(),
                                    prompt_variant: variant.clone(),
                                    tool_reliability,
                                    difficulty: difficulty.clone(),
                                    task_type: task_type.clone(),
                                },
                                node,
                            ));
                        }
                    }
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Merge-before-overwrite: `self` is the document read from disk. Nodes for `dirty` keys
    /// are taken from `local`; everything else on disk is carried forward untouched.
    pub fn merge_dirty<'a>(
        &mut self,
        local: &StoreDocument,
        dirty: impl IntoIterator<Item = &'a AggregationKey>,
        now: DateTime<Utc>,
    ) {
        for key in dirty {
            let Some(node) = local.node(key) else {
                continue;
            };
            let local_model = local.models.get(&key.model);

            let existed = self.models.contains_key(&key.model);
            let target = self.node_mut(key, now);
            *target = node.clone();

            if let (Some(local_model), Some(model)) = (local_model, self.models.get_mut(&key.model)) {
                if existed {
                    model.first_seen = model.first_seen.min(local_model.first_seen);
                } else {
                    model.first_seen = local_model.first_seen;
                }
                model.last_seen = model.last_seen.max(local_model.last_seen);
            }
        }
        self.recompute(now);
    }

    /// Recomputes per-model totals and the store summary from the leaves.
    pub fn recompute(&mut self, now: DateTime<Utc>) {
        let mut summary = Summary::default();

        for (name, model) in self.models.iter_mut() {
            let mut total = 0u64;
            for variant in model.by_prompt_variant.values_mut() {
                for rate in variant.by_tool_reliability.values_mut() {
                    for difficulty in rate.by_difficulty.values_mut() {
                        for node in difficulty.by_task_type.values_mut() {
                            node.refresh_derived();
                            total = total.saturating_add(node.total);
                            summary.total_success = summary.total_success.saturating_add(node.success);
                            summary.total_partial =
                                summary.total_partial.saturating_add(node.partial_success);
                            summary.total_failure = summary.total_failure.saturating_add(node.failed);
                        }
                    }
                }
            }
            model.total_tests = total;
            summary.total_tests = summary.total_tests.saturating_add(total);
            summary.models_tested.push(name.clone());
        }

        self.summary = summary;
        self.version = DOCUMENT_VERSION;
        self.last_updated = now;
    }
}
