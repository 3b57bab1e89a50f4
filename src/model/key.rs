use std::collections::{HashMap, HashSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::outcome::OutcomeRecord;
use crate::config::NormalizationConfig;
use crate::error::{Result, StoreError};

pub const DEFAULT_PROMPT_VARIANT: &str = "baseline";
pub const UNKNOWN_DIMENSION: &str = "unknown";
pub const FLAWED_PREFIX: &str = "flawed";

/// Tool reliability quantized to 4 decimals, held as parts per 10_000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToolReliability(u16);

const RELIABILITY_SCALE: f64 = 10_000.0;

impl ToolReliability {
    pub const FULL: Self = Self(10_000);

    /// Quantizes a raw rate, clamping into [0, 1]. Non-finite input is treated as 1.0.
    pub fn from_f64(rate: f64) -> Self {
        if !rate.is_finite() {
            return Self::FULL;
        }
        let clamped = rate.clamp(0.0, 1.0);
        Self((clamped * RELIABILITY_SCALE).round() as u16)
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / RELIABILITY_SCALE
    }

    /// Canonical string form used as a JSON map key (e.g. "0.8000").
    pub fn as_key(self) -> String {
        format!("{:.4}", self.as_f64())
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<f64>().ok().map(Self::from_f64)
    }
}

impl fmt::Display for ToolReliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.as_f64())
    }
}

impl Serialize for ToolReliability {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for ToolReliability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self::from_f64(n)),
            Raw::Text(s) => Self::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid tool reliability {s:?}"))),
        }
    }
}

/// Identity of one statistic: the unit both backends aggregate by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationKey {
    pub model: String,
    pub prompt_variant: String,
    pub tool_reliability: ToolReliability,
    pub difficulty: String,
    pub task_type: String,
}

impl AggregationKey {
    /// Builds the key an outcome is counted under, canonicalizing the model name.
    pub fn from_outcome(record: &OutcomeRecord, normalizer: &ModelNormalizer) -> Result<Self> {
        let model = normalizer.normalize(&record.model);
        if model.is_empty() {
            return Err(StoreError::InvalidRecord("model is empty".into()));
        }

        Ok(Self {
            model,
            prompt_variant: resolve_prompt_variant(&record.prompt_variant, record.flaw_type.as_deref()),
            tool_reliability: ToolReliability::from_f64(record.tool_reliability),
            difficulty: non_empty_or(&record.difficulty, UNKNOWN_DIMENSION),
            task_type: non_empty_or(&record.task_type, UNKNOWN_DIMENSION),
        })
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.model, self.prompt_variant, self.tool_reliability, self.difficulty, self.task_type
        )
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Folds a flaw marker into the prompt variant as `flawed:<subtype>`.
pub fn resolve_prompt_variant(variant: &str, flaw_type: Option<&str>) -> String {
    let base = non_empty_or(variant, DEFAULT_PROMPT_VARIANT);
    match flaw_type.map(str::trim).filter(|s| !s.is_empty()) {
        Some(subtype) if flaw_subtype(&base).is_none() => format!("{FLAWED_PREFIX}:{subtype}"),
        _ => base,
    }
}

/// Returns the flaw subtype of a `flawed:<subtype>` variant.
pub fn flaw_subtype(variant: &str) -> Option<&str> {
    variant
        .strip_prefix(FLAWED_PREFIX)
        .and_then(|rest| rest.strip_prefix(':').or(rest.strip_prefix('_')))
        .filter(|s| !s.is_empty())
}

/// Canonicalizes model names so worker-instance variants share one identity.
#[derive(Debug, Clone)]
pub struct ModelNormalizer {
    aliases: HashMap<String, String>,
    known_models: HashSet<String>,
    instance_suffix: Regex,
}

impl ModelNormalizer {
    pub fn new(cfg: &NormalizationConfig) -> Result<Self> {
        let instance_suffix = Regex::new(&cfg.instance_suffix).map_err(|e| {
            StoreError::InvalidConfig(format!("instance suffix {:?}: {e}", cfg.instance_suffix))
        })?;

        Ok(Self {
            aliases: cfg
                .aliases
                .iter()
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect(),
            known_models: cfg.known_models.iter().map(|s| s.trim().to_string()).collect(),
            instance_suffix,
        })
    }

    /// Collapses `<known>-<instance>` onto `<known>`. Only one suffix is stripped, and only
    /// onto a configured known model, so `gpt-4` and `gpt-3` never share a key.
    pub fn normalize(&self, raw: &str) -> String {
        let name = raw.trim();
        if let Some(canonical) = self.aliases.get(name) {
            return canonical.clone();
        }
        if self.known_models.contains(name) {
            return name.to_string();
        }

        match self.instance_suffix.find(name) {
            Some(m) if !m.is_empty() && self.known_models.contains(&name[..m.start()]) => {
                name[..m.start()].to_string()
            }
            _ => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> ModelNormalizer {
        ModelNormalizer::new(&NormalizationConfig::default()).expect("default normalizer")
    }

    fn record(model: &str) -> OutcomeRecord {
        OutcomeRecord {
            model: model.to_string(),
            prompt_variant: "concise".into(),
            tool_reliability: 0.8,
            difficulty: "hard".into(),
            task_type: "file_ops".into(),
            ..Default::default()
        }
    }

    fn normalizer_knowing(models: &[&str]) -> ModelNormalizer {
        ModelNormalizer::new(&NormalizationConfig {
            known_models: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        })
        .expect("normalizer")
    }

    #[test]
    fn test_instance_suffixes_collapse_onto_known_model() {
        let n = normalizer_knowing(&["modelX", "qwen2.5-7b"]);
        assert_eq!(n.normalize("modelX-2"), "modelX");
        assert_eq!(n.normalize("modelX-3"), "modelX");
        assert_eq!(n.normalize("  modelX "), "modelX");
        assert_eq!(n.normalize("qwen2.5-7b-12"), "qwen2.5-7b");
        // One suffix at most.
        assert_eq!(n.normalize("modelX-2-3"), "modelX-2-3");
        // Three digits is not an instance suffix.
        assert_eq!(n.normalize("modelX-123"), "modelX-123");
    }

    #[test]
    fn test_versioned_names_stay_distinct() {
        let n = normalizer();
        assert_ne!(n.normalize("gpt-4"), n.normalize("gpt-3"));
        assert_eq!(n.normalize("gpt-4"), "gpt-4");
        assert_eq!(n.normalize("claude-3-5"), "claude-3-5");
        assert_eq!(n.normalize("llama-3"), "llama-3");

        let n = normalizer_knowing(&["gpt-4", "gpt-3"]);
        assert_eq!(n.normalize("gpt-4-2"), "gpt-4");
        assert_eq!(n.normalize("gpt-3-2"), "gpt-3");
        assert_eq!(n.normalize("gpt-4"), "gpt-4");
    }

    #[test]
    fn test_aliases() {
        let mut aliases = HashMap::new();
        aliases.insert("gpt4o-eu".to_string(), "gpt-4o".to_string());
        let n = ModelNormalizer::new(&NormalizationConfig {
            aliases,
            ..Default::default()
        })
        .expect("normalizer");
        assert_eq!(n.normalize("gpt4o-eu"), "gpt-4o");
        assert_eq!(n.normalize("gpt4o-eu-2"), "gpt4o-eu-2");
    }

    #[test]
    fn test_suffix_only_name_is_kept() {
        let n = normalizer_knowing(&["modelX"]);
        assert_eq!(n.normalize("-7"), "-7");
    }

    #[test]
    fn test_tool_reliability_quantization() {
        assert_eq!(ToolReliability::from_f64(0.80004).as_key(), "0.8000");
        assert_eq!(ToolReliability::from_f64(0.33335).as_key(), "0.3334");
        assert_eq!(ToolReliability::from_f64(1.7), ToolReliability::FULL);
        assert_eq!(ToolReliability::from_f64(-0.2).as_key(), "0.0000");
        assert_eq!(ToolReliability::from_f64(f64::NAN), ToolReliability::FULL);
        assert_eq!(ToolReliability::parse("0.8"), Some(ToolReliability::from_f64(0.8)));
    }

    #[test]
    fn test_tool_reliability_serde_accepts_number_and_text() {
        let a: ToolReliability = serde_json::from_str("0.75").expect("number");
        let b: ToolReliability = serde_json::from_str("\"0.7500\"").expect("text");
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).expect("ser"), "0.75");
    }

    #[test]
    fn test_key_from_outcome() {
        let n = normalizer_knowing(&["modelX"]);
        let key = AggregationKey::from_outcome(&record("modelX-2"), &n).expect("key");
        assert_eq!(key.model, "modelX");
        assert_eq!(key.prompt_variant, "concise");
        assert_eq!(key.tool_reliability.as_key(), "0.8000");
        assert_eq!(key.to_string(), "modelX/concise/0.8000/hard/file_ops");
    }

    #[test]
    fn test_key_defaults_for_missing_dimensions() {
        let n = normalizer();
        let r = OutcomeRecord {
            model: "m".into(),
            tool_reliability: 1.0,
            ..Default::default()
        };
        let key = AggregationKey::from_outcome(&r, &n).expect("key");
        assert_eq!(key.prompt_variant, DEFAULT_PROMPT_VARIANT);
        assert_eq!(key.difficulty, UNKNOWN_DIMENSION);
        assert_eq!(key.task_type, UNKNOWN_DIMENSION);
    }

    #[test]
    fn test_flaw_marker_becomes_variant() {
        let n = normalizer();
        let mut r = record("m");
        r.flaw_type = Some("missing_step".into());
        let key = AggregationKey::from_outcome(&r, &n).expect("key");
        assert_eq!(key.prompt_variant, "flawed:missing_step");
        assert_eq!(flaw_subtype(&key.prompt_variant), Some("missing_step"));

        // Already-flawed variants are left alone.
        assert_eq!(
            resolve_prompt_variant("flawed:order", Some("missing_step")),
            "flawed:order"
        );
        assert_eq!(flaw_subtype("flawed_order"), Some("order"));
        assert_eq!(flaw_subtype("baseline"), None);
    }
}
