//! Producer side of staged ingestion.
//!
//! Producers never touch the shared store in staged mode. Each submission becomes one private
//! staging file that the elected [`Merger`] later ingests.

pub mod merger;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::export::StoreMetrics;
use crate::lock;
use crate::model::OutcomeRecord;

pub use self::merger::{CycleReport, Merger};

/// Describes the producer that wrote a staging file. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl ProcessInfo {
    /// Describes the current process.
    pub fn current() -> Self {
        Self {
            executable: std::env::current_exe()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: None,
        }
    }
}

impl Default for ProcessInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// One producer submission, as written to the staging directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingFile {
    pub model: String,
    pub results: Vec<OutcomeRecord>,
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub process_info: ProcessInfo,
    pub result_count: usize,
}

/// Writes staging files for the merger to pick up.
#[derive(Clone)]
pub struct Collector {
    staging_dir: PathBuf,
    metrics: Arc<StoreMetrics>,
}

impl Collector {
    pub fn new(staging_dir: impl Into<PathBuf>, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            metrics,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Writes `records` as one staging file and returns its path. An empty batch writes
    /// nothing.
    pub fn submit_batch(
        &self,
        model: &str,
        records: &[OutcomeRecord],
        info: &ProcessInfo,
    ) -> Result<Option<PathBuf>> {
        if records.is_empty() {
            return Ok(None);
        }

        let pid = std::process::id();
        let payload = StagingFile {
            model: model.to_string(),
            results: records.to_vec(),
            timestamp: Utc::now(),
            pid,
            process_info: info.clone(),
            result_count: records.len(),
        };

        let name = format!(
            "{}_{}_{}.json",
            sanitize_model(model),
            pid,
            lock::unique_timestamp_micros()
        );
        let path = self.staging_dir.join(name);
        lock::write_json_atomic(&path, &payload)?;

        self.metrics.staging_files_written.inc();
        debug!(path = %path.display(), model, results = records.len(), "staging file written");

        Ok(Some(path))
    }
}

/// Maps a model name onto a filesystem-safe file name component.
pub fn sanitize_model(model: &str) -> String {
    let sanitized: String = model
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized.to_string()
    }
}

/// Lists complete staging files, oldest name first. Temp files and quarantined files are
/// never listed.
pub fn list_staging(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with('.') && name.ends_with(".json") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
