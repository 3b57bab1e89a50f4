//! Maps unsuccessful outcomes onto the eight canonical error categories.
//!
//! One policy is applied everywhere: a usable label is matched exactly, by substring, by
//! similarity and finally by keywords; without a label the error text is scanned in a fixed
//! priority order.

use std::fmt;
use std::sync::Arc;

use similar::TextDiff;
use tracing::trace;

use crate::config::ClassificationConfig;
use crate::model::{ErrorCategory, OutcomeRecord, Tier};

/// Keyword table scanned in order; the first category with a hit wins.
const KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Timeout,
        &["timed out", "timeout", "time out", "time-out", "deadline exceeded"],
    ),
    (
        ErrorCategory::Dependency,
        &["dependency", "dependencies", "depends on", "prerequisite", "missing dependency"],
    ),
    (
        ErrorCategory::Parameter,
        &["parameter", "argument", "missing required", "wrong type", "invalid input"],
    ),
    (
        ErrorCategory::ToolSelection,
        &["tool selection", "wrong tool", "unknown tool", "tool not found", "no such tool"],
    ),
    (
        ErrorCategory::Sequence,
        &["sequence", "out of order", "wrong order", "ordering"],
    ),
    (
        ErrorCategory::MaxTurns,
        &["max turns", "maximum turns", "turn limit", "too many turns"],
    ),
    (
        ErrorCategory::Format,
        &["format", "malformed", "parse error", "failed to parse", "invalid json", "unexpected token"],
    ),
];

/// Words that rule out the zero-tool-call format default.
const TRANSIENT_KEYWORDS: &[&str] = &[
    "timed out",
    "timeout",
    "time out",
    "connection",
    "network",
    "rate limit",
    "502",
    "503",
];

/// Common misspellings seen in upstream labels.
const TYPOS: &[(&str, &str)] = &[
    ("time_out", "timeout"),
    ("timout", "timeout"),
    ("timeot", "timeout"),
    ("paramter", "parameter"),
    ("parmeter", "parameter"),
    ("dependancy", "dependency"),
    ("dependecy", "dependency"),
    ("sequnce", "sequence"),
    ("seqeunce", "sequence"),
    ("formating", "format"),
    ("max_turn_", "max_turns_"),
];

/// A category label produced outside the harness.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub category: String,
    pub confidence: Option<f64>,
}

/// Boundary to an external (e.g. model-backed) classifier. Implementations must not block
/// for long; they run inside `add_outcome`.
pub trait ErrorLabeler: Send + Sync {
    fn label(&self, record: &OutcomeRecord) -> Option<Label>;
}

#[derive(Clone)]
pub struct Classifier {
    similarity_threshold: f64,
    min_label_confidence: f64,
    labeler: Option<Arc<dyn ErrorLabeler>>,
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("similarity_threshold", &self.similarity_threshold)
            .field("min_label_confidence", &self.min_label_confidence)
            .field("labeler", &self.labeler.is_some())
            .finish()
    }
}

impl Classifier {
    pub fn new(cfg: &ClassificationConfig) -> Self {
        Self {
            similarity_threshold: cfg.similarity_threshold,
            min_label_confidence: cfg.min_label_confidence,
            labeler: None,
        }
    }

    pub fn with_labeler(mut self, labeler: Arc<dyn ErrorLabeler>) -> Self {
        self.labeler = Some(labeler);
        self
    }

    /// The category an outcome is counted under: `None` for the success tier, otherwise
    /// exactly one category.
    pub fn category_for(&self, record: &OutcomeRecord) -> Option<ErrorCategory> {
        if record.tier() == Tier::Success {
            return None;
        }

        let label = self.usable_label(record);
        let category = self
            .classify(record, label.as_deref())
            .unwrap_or(ErrorCategory::Other);
        trace!(test_id = %record.test_id, category = %category, "classified outcome");
        Some(category)
    }

    /// Classifies an outcome given an optional pre-computed label. Full successes yield `None`.
    pub fn classify(&self, record: &OutcomeRecord, label: Option<&str>) -> Option<ErrorCategory> {
        if record.is_full_success() {
            return None;
        }

        let normalized = label.map(normalize_label).filter(|l| !l.is_empty());
        match normalized {
            Some(label) => Some(self.match_label(&label, record.error.as_deref())),
            None => Some(
                scan_keywords(record.error.as_deref().unwrap_or_default())
                    .unwrap_or_else(|| unmatched_default(record)),
            ),
        }
    }

    fn usable_label(&self, record: &OutcomeRecord) -> Option<String> {
        let attached = record.error_category.as_ref().map(|category| Label {
            category: category.clone(),
            confidence: record.error_category_confidence,
        });
        let label = attached.or_else(|| self.labeler.as_ref().and_then(|l| l.label(record)))?;

        match label.confidence {
            Some(c) if c < self.min_label_confidence => {
                trace!(label = %label.category, confidence = c, "ignoring low-confidence label");
                None
            }
            _ => Some(label.category),
        }
    }

    fn match_label(&self, label: &str, error_text: Option<&str>) -> ErrorCategory {
        if let Some(category) = ErrorCategory::from_name(label) {
            return category;
        }

        if let Some(category) = ErrorCategory::ALL
            .into_iter()
            .find(|c| label.contains(c.as_str()) || (label.len() >= 4 && c.as_str().contains(label)))
        {
            return category;
        }

        let best = ErrorCategory::ALL
            .into_iter()
            .map(|c| (c, similarity(label, c.as_str())))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((category, score)) = best {
            if score >= self.similarity_threshold {
                return category;
            }
        }

        let mut text = label.replace('_', " ");
        if let Some(error) = error_text {
            text.push(' ');
            text.push_str(error);
        }
        scan_keywords(&text).unwrap_or(ErrorCategory::Other)
    }
}

/// Folds case and separators, strips an `_errors` suffix and fixes common typos.
pub fn normalize_label(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        let ch = if matches!(ch, '-' | ' ' | '.' | '/') { '_' } else { ch };
        if ch == '_' && folded.ends_with('_') {
            continue;
        }
        folded.push(ch);
    }
    let mut label = folded.trim_matches('_').to_string();

    for (typo, fixed) in TYPOS {
        if label.contains(typo) {
            label = label.replace(typo, fixed);
        }
    }

    for suffix in ["_errors", "_error"] {
        if let Some(stripped) = label.strip_suffix(suffix) {
            label = stripped.to_string();
            break;
        }
    }
    label
}

fn scan_keywords(text: &str) -> Option<ErrorCategory> {
    if text.is_empty() {
        return None;
    }
    let lower = text.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(category, _)| *category)
}

fn unmatched_default(record: &OutcomeRecord) -> ErrorCategory {
    let lower = record.error.as_deref().unwrap_or_default().to_lowercase();
    let transient = TRANSIENT_KEYWORDS.iter().any(|w| lower.contains(w));
    if record.tool_calls == 0 && !transient {
        ErrorCategory::Format
    } else {
        ErrorCategory::Other
    }
}

fn similarity(a: &str, b: &str) -> f64 {
    f64::from(TextDiff::from_chars(a, b).ratio())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedLabeler(&'static str, f64);

    impl ErrorLabeler for FixedLabeler {
        fn label(&self, _record: &OutcomeRecord) -> Option<Label> {
            Some(Label {
                category: self.0.to_string(),
                confidence: Some(self.1),
            })
        }
    }

    fn classifier() -> Classifier {
        Classifier::new(&ClassificationConfig::default())
    }

    fn failed(error: Option<&str>, tool_calls: u32) -> OutcomeRecord {
        OutcomeRecord {
            model: "m".into(),
            error: error.map(str::to_string),
            tool_calls,
            ..Default::default()
        }
    }

    #[test]
    fn test_timeout_spellings_agree() {
        let c = classifier();
        let r = failed(None, 2);
        for label in ["TIMEOUT_ERRORS", "timeout", "time-out", "Time Out", "timout_error"] {
            assert_eq!(c.classify(&r, Some(label)), Some(ErrorCategory::Timeout), "{label}");
        }
        let text = failed(Some("The model timed out"), 2);
        assert_eq!(c.classify(&text, None), Some(ErrorCategory::Timeout));
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("  Tool-Selection Errors "), "tool_selection");
        assert_eq!(normalize_label("PARAMTER_ERROR"), "parameter");
        assert_eq!(normalize_label("max.turns"), "max_turns");
        assert_eq!(normalize_label("--"), "");
    }

    #[test]
    fn test_label_matching_stages() {
        let c = classifier();
        let r = failed(None, 1);
        // Substring.
        assert_eq!(
            c.classify(&r, Some("max_turns_exceeded")),
            Some(ErrorCategory::MaxTurns)
        );
        // Similarity.
        assert_eq!(
            c.classify(&r, Some("tool_selecton")),
            Some(ErrorCategory::ToolSelection)
        );
        // Keywords from the label itself.
        assert_eq!(
            c.classify(&r, Some("called_wrong_tool")),
            Some(ErrorCategory::ToolSelection)
        );
        // Keywords from the error text.
        let with_text = failed(Some("steps ran out of order"), 1);
        assert_eq!(
            c.classify(&with_text, Some("workflow_issue")),
            Some(ErrorCategory::Sequence)
        );
        // Nothing matches.
        assert_eq!(c.classify(&r, Some("cosmic_rays")), Some(ErrorCategory::Other));
    }

    #[test]
    fn test_keyword_priority() {
        let c = classifier();
        let r = failed(Some("invalid parameter after request timed out"), 1);
        assert_eq!(c.classify(&r, None), Some(ErrorCategory::Timeout));
        let r = failed(Some("missing dependency: bad argument"), 1);
        assert_eq!(c.classify(&r, None), Some(ErrorCategory::Dependency));
        let r = failed(Some("hit the turn limit"), 4);
        assert_eq!(c.classify(&r, None), Some(ErrorCategory::MaxTurns));
    }

    #[test]
    fn test_format_default_only_without_tool_calls() {
        let c = classifier();
        assert_eq!(c.classify(&failed(None, 0), None), Some(ErrorCategory::Format));
        assert_eq!(c.classify(&failed(None, 3), None), Some(ErrorCategory::Other));
        assert_eq!(
            c.classify(&failed(Some("connection reset by peer"), 0), None),
            Some(ErrorCategory::Other)
        );
    }

    #[test]
    fn test_full_success_has_no_category() {
        let c = classifier();
        let r = OutcomeRecord {
            model: "m".into(),
            success: true,
            error: Some("timed out".into()),
            ..Default::default()
        };
        assert_eq!(c.classify(&r, Some("timeout")), None);
        assert_eq!(c.category_for(&r), None);
    }

    #[test]
    fn test_failed_record_with_full_success_level_is_classified() {
        let c = classifier();
        let mut r = failed(Some("request timed out"), 2);
        r.success_level = Some(crate::model::SuccessLevel::FullSuccess);
        assert_eq!(c.category_for(&r), Some(ErrorCategory::Timeout));
    }

    #[test]
    fn test_category_for_partial_always_has_category() {
        let c = classifier();
        let r = OutcomeRecord {
            model: "m".into(),
            partial_success: true,
            tool_calls: 2,
            ..Default::default()
        };
        assert_eq!(c.category_for(&r), Some(ErrorCategory::Other));
    }

    #[test]
    fn test_attached_label_respects_confidence() {
        let c = Classifier::new(&ClassificationConfig {
            min_label_confidence: 0.5,
            ..Default::default()
        });
        let mut r = failed(Some("bad argument"), 1);
        r.error_category = Some("timeout".into());
        r.error_category_confidence = Some(0.2);
        assert_eq!(c.category_for(&r), Some(ErrorCategory::Parameter));

        r.error_category_confidence = Some(0.9);
        assert_eq!(c.category_for(&r), Some(ErrorCategory::Timeout));
    }

    #[test]
    fn test_external_labeler_used_when_no_label_attached() {
        let c = classifier().with_labeler(Arc::new(FixedLabeler("dependency_errors", 0.8)));
        let r = failed(Some("something odd"), 1);
        assert_eq!(c.category_for(&r), Some(ErrorCategory::Dependency));
    }
}
