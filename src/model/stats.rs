use serde::{Deserialize, Serialize};

use super::category::{CategoryCounts, CategoryRates, ErrorCategory};
use super::outcome::{OutcomeRecord, Tier};

/// Metrics tracked as running means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeanField {
    Duration,
    Turns,
    ToolCalls,
    ToolCoverage,
    OverallScore,
    AccuracyScore,
    CompletenessScore,
    EfficiencyScore,
}

impl MeanField {
    pub const ALL: [MeanField; 8] = [
        Self::Duration,
        Self::Turns,
        Self::ToolCalls,
        Self::ToolCoverage,
        Self::OverallScore,
        Self::AccuracyScore,
        Self::CompletenessScore,
        Self::EfficiencyScore,
    ];

    /// Extracts this metric from an outcome. Optional scores that are absent yield `None`.
    pub fn sample(self, record: &OutcomeRecord) -> Option<f64> {
        let value = match self {
            Self::Duration => Some(record.duration_secs),
            Self::Turns => Some(f64::from(record.turns)),
            Self::ToolCalls => Some(f64::from(record.tool_calls)),
            Self::ToolCoverage => Some(record.tool_coverage),
            Self::OverallScore => record.overall_score,
            Self::AccuracyScore => record.accuracy_score,
            Self::CompletenessScore => record.completeness_score,
            Self::EfficiencyScore => record.efficiency_score,
        };
        value.filter(|v| v.is_finite())
    }
}

/// A mean together with the number of samples behind it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Mean {
    pub value: f64,
    pub samples: u64,
}

impl Mean {
    pub fn push(&mut self, sample: f64) {
        self.samples = self.samples.saturating_add(1);
        self.value += (sample - self.value) / self.samples as f64;
    }

    /// Combines two means weighted by their sample counts.
    pub fn combine(&mut self, other: Mean) {
        let n = self.samples.saturating_add(other.samples);
        if n == 0 {
            return;
        }
        self.value = (self.value * self.samples as f64 + other.value * other.samples as f64) / n as f64;
        self.samples = n;
    }
}

/// Running means, each paired with its own sample count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Means {
    #[serde(default)]
    pub avg_duration: f64,
    #[serde(default)]
    pub duration_samples: u64,
    #[serde(default)]
    pub avg_turns: f64,
    #[serde(default)]
    pub turns_samples: u64,
    #[serde(default)]
    pub avg_tool_calls: f64,
    #[serde(default)]
    pub tool_calls_samples: u64,
    #[serde(default)]
    pub avg_tool_coverage: f64,
    #[serde(default)]
    pub tool_coverage_samples: u64,
    #[serde(default)]
    pub avg_overall_score: f64,
    #[serde(default)]
    pub overall_score_samples: u64,
    #[serde(default)]
    pub avg_accuracy_score: f64,
    #[serde(default)]
    pub accuracy_score_samples: u64,
    #[serde(default)]
    pub avg_completeness_score: f64,
    #[serde(default)]
    pub completeness_score_samples: u64,
    #[serde(default)]
    pub avg_efficiency_score: f64,
    #[serde(default)]
    pub efficiency_score_samples: u64,
}

impl Means {
    pub fn get(&self, field: MeanField) -> Mean {
        let (value, samples) = match field {
            MeanField::Duration => (self.avg_duration, self.duration_samples),
            MeanField::Turns => (self.avg_turns, self.turns_samples),
            MeanField::ToolCalls => (self.avg_tool_calls, self.tool_calls_samples),
            MeanField::ToolCoverage => (self.avg_tool_coverage, self.tool_coverage_samples),
            MeanField::OverallScore => (self.avg_overall_score, self.overall_score_samples),
            MeanField::AccuracyScore => (self.avg_accuracy_score, self.accuracy_score_samples),
            MeanField::CompletenessScore => {
                (self.avg_completeness_score, self.completeness_score_samples)
            }
            MeanField::EfficiencyScore => (self.avg_efficiency_score, self.efficiency_score_samples),
        };
        Mean { value, samples }
    }

    pub fn set(&mut self, field: MeanField, mean: Mean) {
        let (value, samples) = match field {
            MeanField::Duration => (&mut self.avg_duration, &mut self.duration_samples),
            MeanField::Turns => (&mut self.avg_turns, &mut self.turns_samples),
            MeanField::ToolCalls => (&mut self.avg_tool_calls, &mut self.tool_calls_samples),
            MeanField::ToolCoverage => {
                (&mut self.avg_tool_coverage, &mut self.tool_coverage_samples)
            }
            MeanField::OverallScore => {
                (&mut self.avg_overall_score, &mut self.overall_score_samples)
            }
            MeanField::AccuracyScore => {
                (&mut self.avg_accuracy_score, &mut self.accuracy_score_samples)
            }
            MeanField::CompletenessScore => (
                &mut self.avg_completeness_score,
                &mut self.completeness_score_samples,
            ),
            MeanField::EfficiencyScore => (
                &mut self.avg_efficiency_score,
                &mut self.efficiency_score_samples,
            ),
        };
        *value = mean.value;
        *samples = mean.samples;
    }

    pub fn push(&mut self, record: &OutcomeRecord) {
        for field in MeanField::ALL {
            if let Some(sample) = field.sample(record) {
                let mut mean = self.get(field);
                mean.push(sample);
                self.set(field, mean);
            }
        }
    }

    pub fn combine(&mut self, other: &Means) {
        for field in MeanField::ALL {
            let mut mean = self.get(field);
            mean.combine(other.get(field));
            self.set(field, mean);
        }
    }
}

/// Aggregated statistics for one [`super::AggregationKey`].
///
/// Derived fields (`totalErrors`, the error rates, `assistRate`, `successRate`) are refreshed
/// on every mutation and never trusted from disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsNode {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub full_success: u64,
    #[serde(default)]
    pub partial_success: u64,
    #[serde(default)]
    pub failed: u64,

    #[serde(default)]
    pub total_errors: u64,
    #[serde(flatten)]
    pub errors: CategoryCounts,
    #[serde(flatten)]
    pub error_rates: CategoryRates,

    #[serde(flatten)]
    pub means: Means,

    #[serde(default)]
    pub assisted_tests: u64,
    #[serde(default)]
    pub total_assists: u64,
    #[serde(default)]
    pub assist_rate: f64,
    #[serde(default)]
    pub success_rate: f64,
}

impl StatisticsNode {
    /// Folds one outcome in. `category` is the outcome's error category, required for every
    /// non-success tier; a missing one is counted as [`ErrorCategory::Other`].
    pub fn apply(&mut self, record: &OutcomeRecord, category: Option<ErrorCategory>) {
        self.total = self.total.saturating_add(1);
        match record.tier() {
            Tier::Success => self.success = self.success.saturating_add(1),
            Tier::Partial => self.partial_success = self.partial_success.saturating_add(1),
            Tier::Failed => self.failed = self.failed.saturating_add(1),
        }
        if record.is_full_success() {
            self.full_success = self.full_success.saturating_add(1);
        }
        if record.tier() != Tier::Success {
            self.errors.increment(category.unwrap_or(ErrorCategory::Other));
        }

        self.means.push(record);

        if record.assist_count > 0 {
            self.assisted_tests = self.assisted_tests.saturating_add(1);
            self.total_assists = self.total_assists.saturating_add(u64::from(record.assist_count));
        }

        self.refresh_derived();
    }

    /// Adds another node's counts into this one, recomputing means from combined sample counts.
    pub fn merge_additive(&mut self, other: &StatisticsNode) {
        self.total = self.total.saturating_add(other.total);
        self.success = self.success.saturating_add(other.success);
        self.full_success = self.full_success.saturating_add(other.full_success);
        self.partial_success = self.partial_success.saturating_add(other.partial_success);
        self.failed = self.failed.saturating_add(other.failed);
        self.errors.add(&other.errors);
        self.means.combine(&other.means);
        self.assisted_tests = self.assisted_tests.saturating_add(other.assisted_tests);
        self.total_assists = self.total_assists.saturating_add(other.total_assists);
        self.refresh_derived();
    }

    /// Recomputes every derived ratio from the raw counters.
    pub fn refresh_derived(&mut self) {
        self.total_errors = self.errors.total();
        self.error_rates = self.errors.rates();
        if self.total == 0 {
            self.assist_rate = 0.0;
            self.success_rate = 0.0;
        } else {
            self.assist_rate = self.assisted_tests as f64 / self.total as f64;
            self.success_rate = self.success as f64 / self.total as f64;
        }
    }

    /// `success + partialSuccess + failed == total`.
    pub fn is_conserved(&self) -> bool {
        self.full_success <= self.success
            && self
                .success
                .checked_add(self.partial_success)
                .and_then(|s| s.checked_add(self.failed))
                == Some(self.total)
    }

    /// Rates sum to one when there are errors, and are all zero otherwise.
    pub fn rates_normalized(&self) -> bool {
        let sum = self.error_rates.sum();
        if self.total_errors == 0 {
            sum == 0.0
        } else {
            (sum - 1.0).abs() <= 1e-6
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::outcome::SuccessLevel;

    fn outcome(success: bool, partial: bool) -> OutcomeRecord {
        OutcomeRecord {
            model: "m".into(),
            success,
            partial_success: partial,
            duration_secs: 2.0,
            turns: 4,
            tool_calls: 3,
            tool_coverage: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_conserves_totals() {
        let mut node = StatisticsNode::default();
        node.apply(&outcome(true, false), None);
        node.apply(&outcome(false, true), Some(ErrorCategory::Sequence));
        node.apply(&outcome(false, false), Some(ErrorCategory::Timeout));
        node.apply(&outcome(false, false), None);

        assert_eq!(node.total, 4);
        assert_eq!(node.success, 1);
        assert_eq!(node.full_success, 1);
        assert_eq!(node.partial_success, 1);
        assert_eq!(node.failed, 2);
        assert!(node.is_conserved());

        // Every non-success tier carries exactly one category.
        assert_eq!(node.total_errors, 3);
        assert_eq!(node.errors.get(ErrorCategory::Other), 1);
        assert!(node.rates_normalized());
        assert!((node.success_rate - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_success_ignores_category() {
        let mut node = StatisticsNode::default();
        node.apply(&outcome(true, false), Some(ErrorCategory::Format));
        assert_eq!(node.total_errors, 0);
        assert!(node.rates_normalized());
        assert_eq!(node.error_rates.sum(), 0.0);
    }

    #[test]
    fn test_full_success_uses_success_level() {
        let mut node = StatisticsNode::default();
        let mut r = outcome(true, false);
        r.success_level = Some(SuccessLevel::PartialSuccess);
        node.apply(&r, None);
        assert_eq!(node.success, 1);
        assert_eq!(node.full_success, 0);
    }

    #[test]
    fn test_full_success_level_on_failed_record() {
        let mut node = StatisticsNode::default();
        let mut r = outcome(false, false);
        r.success_level = Some(SuccessLevel::FullSuccess);
        node.apply(&r, Some(ErrorCategory::Timeout));

        assert_eq!(node.failed, 1);
        assert_eq!(node.success, 0);
        assert_eq!(node.full_success, 0);
        assert_eq!(node.errors.get(ErrorCategory::Timeout), 1);
        assert!(node.is_conserved());
    }

    #[test]
    fn test_running_means_track_own_sample_counts() {
        let mut node = StatisticsNode::default();
        let mut a = outcome(true, false);
        a.duration_secs = 1.0;
        a.overall_score = Some(0.9);
        let mut b = outcome(true, false);
        b.duration_secs = 3.0;

        node.apply(&a, None);
        node.apply(&b, None);

        let duration = node.means.get(MeanField::Duration);
        assert_eq!(duration.samples, 2);
        assert!((duration.value - 2.0).abs() < 1e-9);

        let overall = node.means.get(MeanField::OverallScore);
        assert_eq!(overall.samples, 1);
        assert!((overall.value - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_merge_additive_weights_means() {
        let mut left = StatisticsNode::default();
        for _ in 0..3 {
            let mut r = outcome(true, false);
            r.duration_secs = 1.0;
            left.apply(&r, None);
        }
        let mut right = StatisticsNode::default();
        let mut r = outcome(false, false);
        r.duration_secs = 5.0;
        right.apply(&r, Some(ErrorCategory::Timeout));

        left.merge_additive(&right);
        assert_eq!(left.total, 4);
        assert_eq!(left.failed, 1);
        assert!(left.is_conserved());
        // (1*3 + 5*1) / 4, not the average of the two means.
        assert!((left.means.avg_duration - 2.0).abs() < 1e-9);
        assert!((left.error_rates.timeout_error_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_assist_counters() {
        let mut node = StatisticsNode::default();
        let mut r = outcome(true, false);
        r.assist_count = 3;
        node.apply(&r, None);
        node.apply(&outcome(true, false), None);
        assert_eq!(node.assisted_tests, 1);
        assert_eq!(node.total_assists, 3);
        assert!((node.assist_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_node_serializes_flat_camel_case() {
        let mut node = StatisticsNode::default();
        node.apply(&outcome(false, false), Some(ErrorCategory::ToolSelection));
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["total"], 1);
        assert_eq!(json["toolSelectionErrors"], 1);
        assert_eq!(json["toolSelectionErrorRate"], 1.0);
        assert_eq!(json["durationSamples"], 1);
        assert!(json.get("errors").is_none());

        let back: StatisticsNode = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, node);
    }
}
