#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Rate allocation across strata.
pub mod allocator;
/// Allocation, stratum, and session configuration types.
pub mod config;
/// Centralized constants used across allocation, reports, stores, and sources.
pub mod constants;
/// Reusable example runners shared by downstream crates.
pub mod example_apps;
mod hash;
/// Field types, stratum keys, and row values.
pub mod key;
/// Stratum balance and skew metrics.
pub mod metrics;
/// Text rendering of stratum tables and session summaries.
pub mod report;
/// Sampling session orchestration.
pub mod session;
/// Data source traits and built-in sources.
pub mod source;
/// Stratum-table persistence.
pub mod store;
/// Stratum sets and ordering.
pub mod strata;
/// Shared type aliases.
pub mod types;

mod errors;

pub use allocator::{AllocationResult, AllocationRound, RateAllocator, calc_rates};
pub use config::{AllocationConfig, SessionConfig, StratumOptions};
pub use errors::SamplerError;
pub use key::{FieldKind, FieldSpec, KeyValue, StratumKey, Value};
pub use metrics::{BalanceComparison, StratumSkew, compare_balance, stratum_skew};
pub use session::SamplingSession;
pub use source::{
    CountsRequest, InMemorySource, MaterializeRequest, MaterializeSummary, StratumCounts,
    StratumSource, Table,
};
pub use store::{FileStratumStore, StratumTable, StratumTableStore};
pub use strata::{SortMode, Stratum, StratumSet};
pub use types::{FieldName, ReportText, SourceId, TableName};
