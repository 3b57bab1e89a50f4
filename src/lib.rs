//! Filesystem-coordinated aggregation of LLM benchmark outcomes.
//!
//! Many worker processes record test outcomes into one shared store on local disk, with no
//! database server. Coordination uses advisory lock files, atomic file replacement and
//! merge-on-write, in one of two layouts:
//!
//! - a hierarchical JSON document (model → prompt variant → tool reliability → difficulty →
//!   task type), merged key-by-key on persist;
//! - a column-major summary table, merged additively, optionally through per-process side
//!   files.
//!
//! Workers either write to the store directly or, in staged mode, drop private staging files
//! that a single elected merger ingests.

pub mod aggregator;
pub mod classify;
pub mod collector;
pub mod config;
pub mod error;
pub mod export;
pub mod flush;
pub mod lock;
pub mod model;
pub mod store;

pub use aggregator::ResultStore;
pub use config::Config;
pub use error::{Result, StoreError};
pub use model::{AggregationKey, OutcomeRecord, StatisticsNode};
pub use store::{KeyedStats, Progress, StatsQuery};
