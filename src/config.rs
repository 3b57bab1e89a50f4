use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for an evalstore process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding every shared store file. Default: "benchmark_results".
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Which backend receives outcomes. Default: hierarchical.
    #[serde(default)]
    pub backend: BackendKind,

    /// Whether producers write the backend directly or through staging files.
    #[serde(default)]
    pub mode: IngestMode,

    /// Advisory lock behavior.
    #[serde(default)]
    pub lock: LockConfig,

    /// Flush trigger configuration.
    #[serde(default)]
    pub flush: FlushConfig,

    /// Columnar backend configuration.
    #[serde(default)]
    pub columnar: ColumnarConfig,

    /// Staging-file merger configuration.
    #[serde(default)]
    pub merger: MergerConfig,

    /// Error classification configuration.
    #[serde(default)]
    pub classification: ClassificationConfig,

    /// Model name canonicalization configuration.
    #[serde(default)]
    pub normalization: NormalizationConfig,
}

/// Backend selection, resolved once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Hierarchical,
    Columnar,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hierarchical => "hierarchical",
            Self::Columnar => "columnar",
        }
    }
}

/// How producers hand outcomes to the shared store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Flush straight into the shared backend file.
    #[default]
    Direct,
    /// Write staging files for a merger process to ingest.
    Staged,
}

/// Lock acquisition strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    /// OS advisory lock on the lock file, falling back when unsupported.
    #[default]
    Native,
    /// Exclusive-create of the lock file with stale-lock recovery.
    CreateExclusive,
}

/// Advisory lock configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Maximum time to wait for a lock. Default: 30s.
    #[serde(default = "default_lock_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Initial retry delay. Default: 20ms.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Upper bound for the backoff delay. Default: 500ms.
    #[serde(default = "default_max_retry_interval", with = "humantime_serde")]
    pub max_retry_interval: Duration,

    /// Age after which a create-exclusive lock file counts as abandoned. Default: 120s.
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    /// Acquisition strategy. Default: native.
    #[serde(default)]
    pub strategy: LockStrategy,
}

/// Flush trigger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FlushConfig {
    /// Flush once this many outcomes are buffered. Default: 50.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Flush at least this often while outcomes are buffered. Default: 30s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Columnar backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnarConfig {
    /// Write side files instead of merging into the shared table. Default: false.
    #[serde(default)]
    pub incremental: bool,

    /// Consolidate automatically once this many side files exist (0 = never). Default: 20.
    #[serde(default = "default_consolidate_after_files")]
    pub consolidate_after_files: usize,
}

/// Merger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MergerConfig {
    /// How often the merger scans the staging directory. Default: 5s.
    #[serde(default = "default_merger_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Staging files older than this are deleted regardless of state. Default: 24h.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// How often the retention sweep runs. Default: 10m.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Error classification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationConfig {
    /// Minimum similarity ratio for fuzzy category matches. Default: 0.75.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Labels with a lower confidence are ignored. Default: 0.0.
    #[serde(default)]
    pub min_label_confidence: f64,
}

/// Model name canonicalization configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizationConfig {
    /// Exact raw name to canonical name mappings.
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// Canonical model names. `<name><instance suffix>` collapses onto a listed name;
    /// anything not listed is kept verbatim (so "gpt-4" and "gpt-3" stay distinct).
    #[serde(default)]
    pub known_models: Vec<String>,

    /// Pattern matching one worker instance suffix. Default: `-\d{1,2}$`.
    #[serde(default = "default_instance_suffix")]
    pub instance_suffix: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("benchmark_results")
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_interval() -> Duration {
    Duration::from_millis(20)
}

fn default_max_retry_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(120)
}

fn default_max_pending() -> usize {
    50
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_consolidate_after_files() -> usize {
    20
}

fn default_merger_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_retention() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_similarity_threshold() -> f64 {
    0.75
}

fn default_instance_suffix() -> String {
    r"-\d{1,2}$".to_string()
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            backend: BackendKind::default(),
            mode: IngestMode::default(),
            lock: LockConfig::default(),
            flush: FlushConfig::default(),
            columnar: ColumnarConfig::default(),
            merger: MergerConfig::default(),
            classification: ClassificationConfig::default(),
            normalization: NormalizationConfig::default(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
            retry_interval: default_retry_interval(),
            max_retry_interval: default_max_retry_interval(),
            stale_after: default_stale_after(),
            strategy: LockStrategy::default(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            interval: default_flush_interval(),
        }
    }
}

impl Default for ColumnarConfig {
    fn default() -> Self {
        Self {
            incremental: false,
            consolidate_after_files: default_consolidate_after_files(),
        }
    }
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_merger_poll_interval(),
            retention: default_retention(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            aliases: HashMap::new(),
            known_models: Vec::new(),
            instance_suffix: default_instance_suffix(),
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            min_label_confidence: 0.0,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            bail!("data_dir is required");
        }

        if self.lock.timeout.is_zero() {
            bail!("lock.timeout must be positive");
        }

        if self.lock.retry_interval.is_zero() {
            bail!("lock.retry_interval must be positive");
        }

        if self.lock.max_retry_interval < self.lock.retry_interval {
            bail!("lock.max_retry_interval must be >= lock.retry_interval");
        }

        if self.lock.stale_after <= self.lock.timeout {
            bail!("lock.stale_after must be greater than lock.timeout");
        }

        if self.flush.max_pending == 0 {
            bail!("flush.max_pending must be positive");
        }

        if self.flush.interval.is_zero() {
            bail!("flush.interval must be positive");
        }

        if self.merger.poll_interval.is_zero() {
            bail!("merger.poll_interval must be positive");
        }

        if self.merger.retention < self.merger.poll_interval {
            bail!("merger.retention must be >= merger.poll_interval");
        }

        if self.merger.sweep_interval.is_zero() {
            bail!("merger.sweep_interval must be positive");
        }

        let threshold = self.classification.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            bail!("classification.similarity_threshold must be in (0, 1]");
        }

        let confidence = self.classification.min_label_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            bail!("classification.min_label_confidence must be in [0, 1]");
        }

        if self.normalization.known_models.iter().any(|m| m.trim().is_empty()) {
            bail!("normalization.known_models entries must be non-empty");
        }

        for (raw, canonical) in &self.normalization.aliases {
            if raw.trim().is_empty() || canonical.trim().is_empty() {
                bail!("normalization.aliases entries must be non-empty");
            }
        }

        let suffix = &self.normalization.instance_suffix;
        if !suffix.ends_with('$') {
            bail!("normalization.instance_suffix must be anchored with '$'");
        }
        regex::Regex::new(suffix)
            .with_context(|| format!("normalization.instance_suffix {suffix:?} is not a valid regex"))?;

        Ok(())
    }

    /// Returns the resolved on-disk layout for this configuration.
    pub fn paths(&self) -> StorePaths {
        StorePaths::new(&self.data_dir)
    }
}

/// On-disk layout of a store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub root: PathBuf,
    /// Hierarchical JSON document.
    pub hierarchical: PathBuf,
    /// Shared columnar summary table.
    pub columnar: PathBuf,
    /// Unconsolidated columnar side files.
    pub incremental_dir: PathBuf,
    /// Batches spilled by failed flushes.
    pub recovery_dir: PathBuf,
    /// Producer staging files.
    pub staging_dir: PathBuf,
    /// Singleton merger lock.
    pub merger_lock: PathBuf,
    /// Per-process metrics textfiles.
    pub metrics_dir: PathBuf,
}

impl StorePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            hierarchical: root.join("stats.json"),
            columnar: root.join("summary.json"),
            incremental_dir: root.join("incremental"),
            recovery_dir: root.join("recovery"),
            staging_dir: root.join("staging"),
            merger_lock: root.join("locks").join("merger"),
            metrics_dir: root.join("metrics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.backend, BackendKind::Hierarchical);
        assert_eq!(cfg.mode, IngestMode::Direct);
        assert_eq!(cfg.lock.timeout, Duration::from_secs(30));
        assert_eq!(cfg.flush.max_pending, 50);
        assert_eq!(cfg.merger.retention, Duration::from_secs(86_400));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_humantime_durations() {
        let yaml = r#"
log_level: debug
data_dir: /var/lib/evalstore
backend: columnar
mode: staged
lock:
  timeout: 5s
  retry_interval: 10ms
  strategy: create_exclusive
flush:
  max_pending: 10
  interval: 2s
columnar:
  incremental: true
normalization:
  aliases:
    gpt4o-mini-eu: gpt-4o-mini
  known_models: [gpt-4]
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.backend, BackendKind::Columnar);
        assert_eq!(cfg.mode, IngestMode::Staged);
        assert_eq!(cfg.lock.timeout, Duration::from_secs(5));
        assert_eq!(cfg.lock.retry_interval, Duration::from_millis(10));
        assert_eq!(cfg.lock.strategy, LockStrategy::CreateExclusive);
        assert_eq!(cfg.flush.interval, Duration::from_secs(2));
        assert!(cfg.columnar.incremental);
        assert_eq!(cfg.normalization.known_models, vec!["gpt-4".to_string()]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_blank_known_model() {
        let mut cfg = Config::default();
        cfg.normalization.known_models = vec!["modelX".into(), " ".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_zero_max_pending() {
        let mut cfg = Config::default();
        cfg.flush.max_pending = 0;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("flush.max_pending"));
    }

    #[test]
    fn test_validation_stale_after_must_exceed_timeout() {
        let mut cfg = Config::default();
        cfg.lock.stale_after = cfg.lock.timeout;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("stale_after"));
    }

    #[test]
    fn test_validation_backoff_bounds() {
        let mut cfg = Config::default();
        cfg.lock.max_retry_interval = Duration::from_millis(1);
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("max_retry_interval"));
    }

    #[test]
    fn test_validation_similarity_threshold_range() {
        let mut cfg = Config::default();
        cfg.classification.similarity_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.classification.similarity_threshold = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_instance_suffix() {
        let mut cfg = Config::default();
        cfg.normalization.instance_suffix = "-(".to_string();
        assert!(cfg.validate().is_err());
        cfg.normalization.instance_suffix = r"-\d+".to_string();
        let err = cfg.validate().expect_err("unanchored");
        assert!(err.to_string().contains("instance_suffix"));
    }

    #[test]
    fn test_store_paths_layout() {
        let paths = StorePaths::new(Path::new("/data"));
        assert_eq!(paths.hierarchical, PathBuf::from("/data/stats.json"));
        assert_eq!(paths.columnar, PathBuf::from("/data/summary.json"));
        assert_eq!(paths.staging_dir, PathBuf::from("/data/staging"));
        assert_eq!(paths.merger_lock, PathBuf::from("/data/locks/merger"));
    }
}
