//! Shared record, key and statistics types used by every store layer.

pub mod category;
pub mod key;
pub mod outcome;
pub mod stats;

pub use category::{CategoryCounts, CategoryRates, ErrorCategory};
pub use key::{AggregationKey, ModelNormalizer, ToolReliability};
pub use outcome::{OutcomeRecord, SuccessLevel, Tier};
pub use stats::{Mean, MeanField, Means, StatisticsNode};
