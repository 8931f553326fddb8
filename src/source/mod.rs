//! Data source interfaces used by the sampling session.
//!
//! Ownership model:
//! - `StratumSource` is the session-facing capability surface: it can produce
//!   grouped counts and materialize a rate-filtered copy of a relation.
//! - The allocator never talks to a source; the session calls the source
//!   strictly before allocation (counts) and after it (materialization).
//! - `InMemorySource` is a reference implementation holding typed tables.

use crate::config::StratumOptions;
use crate::errors::SamplerError;
use crate::key::{FieldSpec, StratumKey};
use crate::strata::{SortMode, StratumSet};
use crate::store::StratumTable;
use crate::types::{FieldName, TableName};

/// JSON-lines encoding of source tables.
pub mod jsonl;
/// In-memory tabular source.
pub mod memory;

pub use memory::{InMemorySource, Table};

/// Request for per-stratum row counts over a relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountsRequest {
    /// Relation to group.
    pub relation: TableName,
    /// Fields to group by, in key order.
    pub fields: Vec<FieldName>,
    /// Groups with fewer rows are dropped by the source.
    pub min_count: u64,
    /// Ordering of the returned groups.
    pub sort_mode: SortMode,
}

impl CountsRequest {
    /// Count request for `relation` grouped by `fields`.
    pub fn new<I, F>(relation: impl Into<TableName>, fields: I, options: StratumOptions) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldName>,
    {
        Self {
            relation: relation.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            min_count: options.min_count,
            sort_mode: options.sort_mode,
        }
    }

    /// Construction options matching this request.
    pub fn options(&self) -> StratumOptions {
        StratumOptions {
            min_count: self.min_count,
            sort_mode: self.sort_mode,
        }
    }
}

/// Grouped counts returned by a source.
#[derive(Clone, Debug, PartialEq)]
pub struct StratumCounts {
    /// Typed grouping fields as reported by the source schema.
    pub fields: Vec<FieldSpec>,
    /// One `(key, count)` per distinct combination, ordered per request.
    pub rows: Vec<(StratumKey, u64)>,
}

impl StratumCounts {
    /// Build a stratum set from these counts.
    pub fn into_stratum_set(self, options: StratumOptions) -> Result<StratumSet, SamplerError> {
        StratumSet::build(self.fields, self.rows, options)
    }
}

/// Request to copy a rate-filtered sample of a relation into a destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializeRequest {
    /// Relation holding the population.
    pub source_relation: TableName,
    /// Persisted stratum table supplying the per-stratum rates.
    pub strata_table: TableName,
    /// Join fields locating each row's stratum.
    pub stratum_fields: Vec<FieldName>,
    /// Table receiving the retained rows.
    pub destination: TableName,
}

/// Outcome of a materialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializeSummary {
    /// Table written.
    pub destination: TableName,
    /// Rows scanned in the source relation.
    pub source_rows: u64,
    /// Rows whose stratum had no rate (filtered out before allocation).
    pub unmatched_rows: u64,
    /// Rows written to the destination.
    pub retained_rows: u64,
}

/// Session-facing data source.
///
/// Implementations own all I/O. For a fixed dataset, `stratum_counts` must
/// be deterministic; `materialize_sample` draws one independent uniform value
/// in `[0, 1)` per source row and keeps the row iff the draw is below its
/// stratum's rate.
pub trait StratumSource: Send + Sync {
    /// Stable source identifier used in errors and logs.
    fn id(&self) -> &str;

    /// Group `request.relation` by `request.fields` and count rows per group.
    ///
    /// Must drop groups below `request.min_count`, order the result per
    /// `request.sort_mode`, and fail with `InvalidFieldType` when any grouping
    /// field is floating point.
    fn stratum_counts(&self, request: &CountsRequest) -> Result<StratumCounts, SamplerError>;

    /// Write the rows of `request.source_relation` retained by a per-row
    /// Bernoulli draw against `rates` into `request.destination`.
    fn materialize_sample(
        &self,
        request: &MaterializeRequest,
        rates: &StratumTable,
    ) -> Result<MaterializeSummary, SamplerError>;
}
