use serde::{Deserialize, Serialize};

/// Canonical error categories an unsuccessful outcome is counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    Dependency,
    Parameter,
    ToolSelection,
    Sequence,
    MaxTurns,
    Format,
    Other,
}

pub const CATEGORY_COUNT: usize = 8;

impl ErrorCategory {
    pub const ALL: [ErrorCategory; CATEGORY_COUNT] = [
        Self::Timeout,
        Self::Dependency,
        Self::Parameter,
        Self::ToolSelection,
        Self::Sequence,
        Self::MaxTurns,
        Self::Format,
        Self::Other,
    ];

    /// Short canonical name (e.g. "tool_selection").
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Dependency => "dependency",
            Self::Parameter => "parameter",
            Self::ToolSelection => "tool_selection",
            Self::Sequence => "sequence",
            Self::MaxTurns => "max_turns",
            Self::Format => "format",
            Self::Other => "other",
        }
    }

    /// Counter name used in stored statistics (e.g. "tool_selection_errors").
    pub const fn counter_name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout_errors",
            Self::Dependency => "dependency_errors",
            Self::Parameter => "parameter_errors",
            Self::ToolSelection => "tool_selection_errors",
            Self::Sequence => "sequence_errors",
            Self::MaxTurns => "max_turns_errors",
            Self::Format => "format_errors",
            Self::Other => "other_errors",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == name || c.counter_name() == name)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category error counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCounts {
    #[serde(default)]
    pub timeout_errors: u64,
    #[serde(default)]
    pub dependency_errors: u64,
    #[serde(default)]
    pub parameter_errors: u64,
    #[serde(default)]
    pub tool_selection_errors: u64,
    #[serde(default)]
    pub sequence_errors: u64,
    #[serde(default)]
    pub max_turns_errors: u64,
    #[serde(default)]
    pub format_errors: u64,
    #[serde(default)]
    pub other_errors: u64,
}

impl CategoryCounts {
    pub fn get(&self, category: ErrorCategory) -> u64 {
        match category {
            ErrorCategory::Timeout => self.timeout_errors,
            ErrorCategory::Dependency => self.dependency_errors,
            ErrorCategory::Parameter => self.parameter_errors,
            ErrorCategory::ToolSelection => self.tool_selection_errors,
            ErrorCategory::Sequence => self.sequence_errors,
            ErrorCategory::MaxTurns => self.max_turns_errors,
            ErrorCategory::Format => self.format_errors,
            ErrorCategory::Other => self.other_errors,
        }
    }

    fn slot(&mut self, category: ErrorCategory) -> &mut u64 {
        match category {
            ErrorCategory::Timeout => &mut self.timeout_errors,
            ErrorCategory::Dependency => &mut self.dependency_errors,
            ErrorCategory::Parameter => &mut self.parameter_errors,
            ErrorCategory::ToolSelection => &mut self.tool_selection_errors,
            ErrorCategory::Sequence => &mut self.sequence_errors,
            ErrorCategory::MaxTurns => &mut self.max_turns_errors,
            ErrorCategory::Format => &mut self.format_errors,
            ErrorCategory::Other => &mut self.other_errors,
        }
    }

    pub fn increment(&mut self, category: ErrorCategory) {
        let slot = self.slot(category);
        *slot = slot.saturating_add(1);
    }

    pub fn add(&mut self, other: &CategoryCounts) {
        for category in ErrorCategory::ALL {
            let slot = self.slot(category);
            *slot = slot.saturating_add(other.get(category));
        }
    }

    pub fn total(&self) -> u64 {
        ErrorCategory::ALL.iter().map(|c| self.get(*c)).sum()
    }

    /// Derives per-category shares of the total; all zero when there are no errors.
    pub fn rates(&self) -> CategoryRates {
        let total = self.total();
        let mut rates = CategoryRates::default();
        if total == 0 {
            return rates;
        }
        for category in ErrorCategory::ALL {
            rates.set(category, self.get(category) as f64 / total as f64);
        }
        rates
    }
}

/// Per-category share of all errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRates {
    #[serde(default)]
    pub timeout_error_rate: f64,
    #[serde(default)]
    pub dependency_error_rate: f64,
    #[serde(default)]
    pub parameter_error_rate: f64,
    #[serde(default)]
    pub tool_selection_error_rate: f64,
    #[serde(default)]
    pub sequence_error_rate: f64,
    #[serde(default)]
    pub max_turns_error_rate: f64,
    #[serde(default)]
    pub format_error_rate: f64,
    #[serde(default)]
    pub other_error_rate: f64,
}

impl CategoryRates {
    pub fn get(&self, category: ErrorCategory) -> f64 {
        match category {
            ErrorCategory::Timeout => self.timeout_error_rate,
            ErrorCategory::Dependency => self.dependency_error_rate,
            ErrorCategory::Parameter => self.parameter_error_rate,
            ErrorCategory::ToolSelection => self.tool_selection_error_rate,
            ErrorCategory::Sequence => self.sequence_error_rate,
            ErrorCategory::MaxTurns => self.max_turns_error_rate,
            ErrorCategory::Format => self.format_error_rate,
            ErrorCategory::Other => self.other_error_rate,
        }
    }

    fn set(&mut self, category: ErrorCategory, value: f64) {
        let slot = match category {
            ErrorCategory::Timeout => &mut self.timeout_error_rate,
            ErrorCategory::Dependency => &mut self.dependency_error_rate,
            ErrorCategory::Parameter => &mut self.parameter_error_rate,
            ErrorCategory::ToolSelection => &mut self.tool_selection_error_rate,
            ErrorCategory::Sequence => &mut self.sequence_error_rate,
            ErrorCategory::MaxTurns => &mut self.max_turns_error_rate,
            ErrorCategory::Format => &mut self.format_error_rate,
            ErrorCategory::Other => &mut self.other_error_rate,
        };
        *slot = value;
    }

    pub fn sum(&self) -> f64 {
        ErrorCategory::ALL.iter().map(|c| self.get(*c)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_accepts_short_and_counter_names() {
        assert_eq!(ErrorCategory::from_name("timeout"), Some(ErrorCategory::Timeout));
        assert_eq!(
            ErrorCategory::from_name("tool_selection_errors"),
            Some(ErrorCategory::ToolSelection)
        );
        assert_eq!(ErrorCategory::from_name("nonsense"), None);
    }

    #[test]
    fn test_rates_sum_to_one() {
        let mut counts = CategoryCounts::default();
        counts.increment(ErrorCategory::Timeout);
        counts.increment(ErrorCategory::Timeout);
        counts.increment(ErrorCategory::Format);

        let rates = counts.rates();
        assert!((rates.sum() - 1.0).abs() < 1e-9);
        assert!((rates.get(ErrorCategory::Timeout) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_zero_without_errors() {
        let rates = CategoryCounts::default().rates();
        assert_eq!(rates, CategoryRates::default());
        assert_eq!(rates.sum(), 0.0);
    }

    #[test]
    fn test_counts_serialize_camel_case() {
        let mut counts = CategoryCounts::default();
        counts.increment(ErrorCategory::MaxTurns);
        let json = serde_json::to_value(counts).expect("serialize");
        assert_eq!(json["maxTurnsErrors"], 1);
        assert_eq!(json["timeoutErrors"], 0);
    }
}
