use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::accumulator::Accumulator;
use crate::model::{AggregationKey, StatisticsNode};

/// One flattened row of the columnar table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryRow {
    #[serde(flatten)]
    pub key: AggregationKey,
    #[serde(flatten)]
    pub stats: StatisticsNode,
    pub last_updated: DateTime<Utc>,
    /// Writer of an incremental or recovery side table. Absent in the shared table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_pid: Option<u32>,
}

impl SummaryRow {
    pub fn from_accumulator(key: AggregationKey, acc: &Accumulator, now: DateTime<Utc>) -> Self {
        Self {
            key,
            stats: acc.to_node(),
            last_updated: now,
            producer_pid: None,
        }
    }

    pub fn with_producer(mut self, pid: u32) -> Self {
        self.producer_pid = Some(pid);
        self
    }

    /// Additive merge: counts are summed and ratios recomputed from the combined totals.
    pub fn absorb(&mut self, other: &SummaryRow) {
        self.stats.merge_additive(&other.stats);
        self.last_updated = self.last_updated.max(other.last_updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutcomeRecord, ToolReliability};

    fn row(successes: usize, failures: usize) -> SummaryRow {
        let mut acc = Accumulator::new();
        for _ in 0..successes {
            acc.record(
                &OutcomeRecord {
                    model: "m".into(),
                    success: true,
                    duration_secs: 1.0,
                    ..Default::default()
                },
                None,
            );
        }
        for _ in 0..failures {
            acc.record(
                &OutcomeRecord {
                    model: "m".into(),
                    duration_secs: 4.0,
                    ..Default::default()
                },
                None,
            );
        }
        let key = AggregationKey {
            model: "m".into(),
            prompt_variant: "baseline".into(),
            tool_reliability: ToolReliability::from_f64(0.5),
            difficulty: "hard".into(),
            task_type: "math".into(),
        };
        SummaryRow::from_accumulator(key, &acc, Utc::now())
    }

    #[test]
    fn test_absorb_is_additive() {
        let mut a = row(3, 1);
        let b = row(1, 3);
        a.absorb(&b);

        assert_eq!(a.stats.total, 8);
        assert_eq!(a.stats.success, 4);
        assert_eq!(a.stats.failed, 4);
        assert!((a.stats.success_rate - 0.5).abs() < 1e-9);
        // (1*4 + 4*4) / 8
        assert!((a.stats.means.avg_duration - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_row_flattens_key_and_stats() {
        let value = serde_json::to_value(row(1, 0).with_producer(42)).expect("serialize");
        assert_eq!(value["model"], "m");
        assert_eq!(value["promptVariant"], "baseline");
        assert_eq!(value["toolReliability"], 0.5);
        assert_eq!(value["total"], 1);
        assert_eq!(value["producerPid"], 42);
        assert!(value.get("lastUpdated").is_some());
        assert!(value.get("key").is_none());
    }
}
