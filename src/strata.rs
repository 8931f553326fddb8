//! Stratum sets: keyed observation counts with optional assigned rates.
//!
//! A `StratumSet` is built once from grouped `(key, count)` rows delivered by a
//! data source. Its membership is fixed at construction: strata below the
//! minimum count are dropped (not zeroed) and `total_count` only reflects the
//! retained rows. The only later mutation is attaching allocated rates.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::config::StratumOptions;
use crate::errors::SamplerError;
use crate::key::{FieldSpec, StratumKey};

/// Ordering of strata within a set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// Descending by count, ties broken by ascending key.
    ByCountDesc,
    /// Ascending by key tuple, compared field by field.
    #[default]
    ByKeyAsc,
}

/// One stratum: its key, observed count, and (once allocated) rate and capture.
#[derive(Clone, Debug, PartialEq)]
pub struct Stratum {
    /// Categorical key tuple.
    pub key: StratumKey,
    /// Observed number of rows.
    pub count: u64,
    /// Assigned sampling rate, `0.0` before allocation.
    pub rate: f64,
    /// Expected captured rows, `floor(rate * count)`.
    pub captured: u64,
}

impl Stratum {
    fn new(key: StratumKey, count: u64) -> Self {
        Self {
            key,
            count,
            rate: 0.0,
            captured: 0,
        }
    }

    fn assign_rate(&mut self, rate: f64) {
        self.rate = rate;
        self.captured = (rate * self.count as f64).floor() as u64;
    }
}

/// Ordered collection of strata over a fixed list of fields.
#[derive(Clone, Debug, PartialEq)]
pub struct StratumSet {
    fields: Vec<FieldSpec>,
    strata: Vec<Stratum>,
    total_count: u64,
    min_count: u64,
    sort_mode: SortMode,
    rates_assigned: bool,
}

impl StratumSet {
    /// Build a stratum set from grouped `(key, count)` rows.
    ///
    /// Fails with `InvalidFieldType` when any field is floating point
    /// (independent of the rows), and with `InvalidStratum` for keys that do
    /// not match the field list, duplicate keys, or retained zero counts.
    /// Rows below `options.min_count` are dropped before the set is finalized.
    pub fn build<I>(
        fields: Vec<FieldSpec>,
        rows: I,
        options: StratumOptions,
    ) -> Result<Self, SamplerError>
    where
        I: IntoIterator<Item = (StratumKey, u64)>,
    {
        validate_fields(&fields)?;

        let mut seen = HashSet::new();
        let mut strata = Vec::new();
        let mut dropped = 0usize;
        let mut total_count: u64 = 0;
        for (key, count) in rows {
            validate_key(&fields, &key)?;
            if !seen.insert(key.clone()) {
                return Err(SamplerError::InvalidStratum(format!(
                    "duplicate stratum key '{key}'"
                )));
            }
            if count < options.min_count {
                dropped += 1;
                continue;
            }
            if count == 0 {
                return Err(SamplerError::InvalidStratum(format!(
                    "stratum '{key}' has zero observations"
                )));
            }
            total_count = total_count.checked_add(count).ok_or_else(|| {
                SamplerError::InvalidStratum("total observation count overflows u64".into())
            })?;
            strata.push(Stratum::new(key, count));
        }

        sort_strata(&mut strata, options.sort_mode);
        debug!(
            fields = fields.len(),
            retained = strata.len(),
            dropped,
            total_count,
            "built stratum set"
        );

        Ok(Self {
            fields,
            strata,
            total_count,
            min_count: options.min_count,
            sort_mode: options.sort_mode,
            rates_assigned: false,
        })
    }

    /// Rebuild with a higher minimum count.
    ///
    /// The result is a fresh set without assigned rates. Lowering the threshold
    /// cannot restore strata dropped at construction and fails; rebuild from the
    /// source instead.
    pub fn filter(&self, min_count: u64) -> Result<Self, SamplerError> {
        if min_count < self.min_count {
            return Err(SamplerError::Configuration(format!(
                "cannot lower min_count from {} to {min_count} without rebuilding from the source",
                self.min_count
            )));
        }
        let rows = self
            .strata
            .iter()
            .map(|stratum| (stratum.key.clone(), stratum.count))
            .collect::<Vec<_>>();
        Self::build(
            self.fields.clone(),
            rows,
            StratumOptions {
                min_count,
                sort_mode: self.sort_mode,
            },
        )
    }

    /// Attach allocated rates, aligned with the current stratum order.
    pub fn apply_rates(&mut self, rates: &[f64]) -> Result<(), SamplerError> {
        if rates.len() != self.strata.len() {
            return Err(SamplerError::InvalidStratum(format!(
                "expected {} rates, got {}",
                self.strata.len(),
                rates.len()
            )));
        }
        if let Some(bad) = rates.iter().find(|rate| !(0.0..=1.0).contains(*rate)) {
            return Err(SamplerError::InvalidStratum(format!(
                "sampling rate {bad} is outside [0, 1]"
            )));
        }
        for (stratum, rate) in self.strata.iter_mut().zip(rates) {
            stratum.assign_rate(*rate);
        }
        self.rates_assigned = true;
        Ok(())
    }

    /// Fields defining the stratification.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Field names in key order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| field.name.as_str()).collect()
    }

    /// Strata in set order.
    pub fn strata(&self) -> &[Stratum] {
        &self.strata
    }

    /// Number of retained strata.
    pub fn len(&self) -> usize {
        self.strata.len()
    }

    /// Whether no strata were retained.
    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    /// Sum of counts over retained strata.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Inclusion threshold applied at construction.
    pub fn min_count(&self) -> u64 {
        self.min_count
    }

    /// Ordering of the strata.
    pub fn sort_mode(&self) -> SortMode {
        self.sort_mode
    }

    /// Whether allocated rates have been attached.
    pub fn has_rates(&self) -> bool {
        self.rates_assigned
    }

    /// Counts in set order.
    pub fn counts(&self) -> Vec<u64> {
        self.strata.iter().map(|stratum| stratum.count).collect()
    }

    /// Rates in set order.
    pub fn rates(&self) -> Vec<f64> {
        self.strata.iter().map(|stratum| stratum.rate).collect()
    }

    /// Sum of per-stratum expected captures.
    pub fn captured_total(&self) -> u64 {
        self.strata.iter().map(|stratum| stratum.captured).sum()
    }

    /// Look up a stratum by key.
    pub fn get(&self, key: &StratumKey) -> Option<&Stratum> {
        self.strata.iter().find(|stratum| &stratum.key == key)
    }
}

fn validate_fields(fields: &[FieldSpec]) -> Result<(), SamplerError> {
    if fields.is_empty() {
        return Err(SamplerError::Configuration(
            "at least one stratification field is required".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for field in fields {
        field.ensure_categorical()?;
        if !names.insert(field.name.as_str()) {
            return Err(SamplerError::Configuration(format!(
                "stratification field '{}' listed twice",
                field.name
            )));
        }
    }
    Ok(())
}

fn validate_key(fields: &[FieldSpec], key: &StratumKey) -> Result<(), SamplerError> {
    if key.arity() != fields.len() {
        return Err(SamplerError::InvalidStratum(format!(
            "key '{key}' has {} values for {} fields",
            key.arity(),
            fields.len()
        )));
    }
    for (field, value) in fields.iter().zip(key.values()) {
        if value.kind() != field.kind {
            return Err(SamplerError::InvalidStratum(format!(
                "key '{key}' holds a {} value for {} field '{}'",
                value.kind(),
                field.kind,
                field.name
            )));
        }
    }
    Ok(())
}

fn sort_strata(strata: &mut [Stratum], mode: SortMode) {
    match mode {
        SortMode::ByCountDesc => {
            strata.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)))
        }
        SortMode::ByKeyAsc => strata.sort_by(|a, b| a.key.cmp(&b.key)),
    }
}
