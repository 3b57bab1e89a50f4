use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Graded result reported by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessLevel {
    FullSuccess,
    PartialSuccess,
    Failure,
}

/// Which of the three mutually exclusive outcome buckets a record falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Success,
    Partial,
    Failed,
}

/// One test result as produced by the execution engine.
///
/// Records are reduced into counters and never stored verbatim, apart from the transient
/// staging files used by the collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    #[serde(default)]
    pub test_id: String,
    pub model: String,
    #[serde(default)]
    pub prompt_variant: String,
    #[serde(default = "default_tool_reliability")]
    pub tool_reliability: f64,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default)]
    pub task_type: String,

    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub partial_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_level: Option<SuccessLevel>,

    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub tool_calls: u32,
    /// Fraction of required tools the model invoked, in [0, 1].
    #[serde(default)]
    pub tool_coverage: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency_score: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Category label attached upstream (e.g. by an external classifier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category_confidence: Option<f64>,

    /// Number of times the harness had to nudge the model.
    #[serde(default)]
    pub assist_count: u32,
    /// Set when the run used a deliberately corrupted prompt/workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flaw_type: Option<String>,
}

fn default_tool_reliability() -> f64 {
    1.0
}

impl OutcomeRecord {
    pub fn tier(&self) -> Tier {
        if self.partial_success {
            Tier::Partial
        } else if self.success {
            Tier::Success
        } else {
            Tier::Failed
        }
    }

    /// A full success is always a success-tier outcome; `success_level` can only narrow it.
    pub fn is_full_success(&self) -> bool {
        self.tier() == Tier::Success
            && self
                .success_level
                .map_or(true, |level| level == SuccessLevel::FullSuccess)
    }

    /// Rejects records that cannot be reduced into counters.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(StoreError::InvalidRecord("model is empty".into()));
        }
        if !self.duration_secs.is_finite() || self.duration_secs < 0.0 {
            return Err(StoreError::InvalidRecord(format!(
                "duration_secs must be a non-negative number, got {}",
                self.duration_secs
            )));
        }
        if !self.tool_coverage.is_finite() {
            return Err(StoreError::InvalidRecord("tool_coverage is not finite".into()));
        }
        Ok(())
    }
}
