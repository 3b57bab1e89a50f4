use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the store layers.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error on {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store file {} is corrupt, moved to {}", path.display(), quarantined_to.display())]
    CorruptStore {
        path: PathBuf,
        quarantined_to: PathBuf,
    },

    #[error("flush failed, {rows} rows spilled to {}: {source}", spilled_to.display())]
    PartialFlush {
        rows: usize,
        spilled_to: PathBuf,
        #[source]
        source: Box<StoreError>,
    },

    #[error("invalid outcome record: {0}")]
    InvalidRecord(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Returns true when the error is a lock acquisition timeout.
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            Self::LockTimeout { .. } => true,
            Self::PartialFlush { source, .. } => source.is_lock_timeout(),
            _ => false,
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
