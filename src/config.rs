use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::constants::allocator::{
    DEFAULT_MAX_ITERATIONS, DEFAULT_SAMPLE_CAP, DEFAULT_TOLERANCE, MAX_EXACT_TARGET,
};
use crate::errors::SamplerError;
use crate::strata::SortMode;
use crate::types::TableName;

/// Inputs to one rate-allocation run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AllocationConfig {
    /// Desired total number of sampled observations.
    pub target_total: u64,
    /// Maximum sampling rate any stratum may receive, in `(0, 1]`.
    pub cap: f64,
    /// Stop once a round's unplaced quota is at most `tolerance * target_total`.
    pub tolerance: f64,
    /// Upper bound on redistribution rounds.
    pub max_iterations: usize,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            target_total: 0,
            cap: DEFAULT_SAMPLE_CAP,
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl AllocationConfig {
    /// Allocation config for `target_total` with default cap and stopping rule.
    pub fn with_target(target_total: u64) -> Self {
        Self {
            target_total,
            ..Self::default()
        }
    }

    /// Validate ranges, returning the config unchanged when usable.
    pub fn validated(self) -> Result<Self, SamplerError> {
        validate_cap(self.cap)?;
        if self.target_total > MAX_EXACT_TARGET {
            return Err(SamplerError::InvalidTarget(self.target_total));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(SamplerError::Configuration(format!(
                "tolerance must be a non-negative finite fraction, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(SamplerError::Configuration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Reject caps outside `(0, 1]` (NaN included).
pub fn validate_cap(cap: f64) -> Result<f64, SamplerError> {
    if cap > 0.0 && cap <= 1.0 {
        Ok(cap)
    } else {
        Err(SamplerError::InvalidCap(cap))
    }
}

/// How a stratum set is filtered and ordered at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumOptions {
    /// Strata with fewer observations than this are dropped (0 keeps all).
    pub min_count: u64,
    /// Ordering of the retained strata.
    pub sort_mode: SortMode,
}

/// Top-level sampling session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relation (table) in the data source holding the population to sample.
    pub source_relation: TableName,
    /// Destination table for the materialized sample.
    pub sample_table: TableName,
    /// Destination table for the persisted strata and sampling rates.
    pub strata_table: TableName,
    /// Desired size of the sample table.
    pub target_total: u64,
    /// Minimum observations for a stratum to be sampled at all.
    pub min_count: u64,
    /// Maximum sampling rate for any stratum.
    pub sample_cap: f64,
    /// Ordering used for all stratum sets built by the session.
    pub sort_mode: SortMode,
    /// Stopping tolerance as a fraction of `target_total`.
    pub tolerance: f64,
    /// Upper bound on allocation rounds.
    pub max_iterations: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            source_relation: TableName::new(),
            sample_table: TableName::new(),
            strata_table: TableName::new(),
            target_total: 0,
            min_count: 0,
            sample_cap: DEFAULT_SAMPLE_CAP,
            sort_mode: SortMode::default(),
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

impl SessionConfig {
    /// Load a session config from a JSON file; missing keys take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SamplerError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: SessionConfig = serde_json::from_str(&raw).map_err(|err| {
            SamplerError::Configuration(format!(
                "invalid session config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        config.validated()
    }

    /// Validate table names and numeric ranges.
    pub fn validated(self) -> Result<Self, SamplerError> {
        for (label, name) in [
            ("source_relation", &self.source_relation),
            ("sample_table", &self.sample_table),
            ("strata_table", &self.strata_table),
        ] {
            if name.trim().is_empty() {
                return Err(SamplerError::Configuration(format!(
                    "{label} must not be empty"
                )));
            }
        }
        if self.sample_table == self.strata_table || self.sample_table == self.source_relation {
            return Err(SamplerError::Configuration(
                "sample_table must differ from strata_table and source_relation".to_string(),
            ));
        }
        self.allocation().validated()?;
        Ok(self)
    }

    /// Allocation inputs derived from this session config.
    pub fn allocation(&self) -> AllocationConfig {
        AllocationConfig {
            target_total: self.target_total,
            cap: self.sample_cap,
            tolerance: self.tolerance,
            max_iterations: self.max_iterations,
        }
    }

    /// Construction options for stratum sets over the source relation.
    pub fn stratum_options(&self) -> StratumOptions {
        StratumOptions {
            min_count: self.min_count,
            sort_mode: self.sort_mode,
        }
    }
}
