use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::allocator::{AllocationResult, RateAllocator};
use crate::config::{AllocationConfig, SessionConfig, StratumOptions, validate_cap};
use crate::errors::SamplerError;
use crate::metrics::{BalanceComparison, compare_balance};
use crate::report::{SessionReport, render_marginals};
use crate::source::{CountsRequest, InMemorySource, MaterializeRequest, MaterializeSummary, StratumSource};
use crate::store::StratumTableStore;
use crate::strata::StratumSet;
use crate::types::{FieldName, ReportText};

/// Orchestrates one stratified sampling run against a data source.
///
/// The pipeline is counts -> stratum set -> rates -> persisted strata table ->
/// materialized sample -> sample strata. Every parameter change discards all
/// derived state; nothing is carried across runs.
pub struct SamplingSession {
    source: Arc<dyn StratumSource>,
    store: Arc<dyn StratumTableStore>,
    config: SessionConfig,
    strata: Option<StratumSet>,
    allocation: Option<AllocationResult>,
    sample_strata: Option<StratumSet>,
    actual_captured: u64,
    materialize_request: Option<MaterializeRequest>,
    materialize_summary: Option<MaterializeSummary>,
}

impl SamplingSession {
    /// Create a session reading from `source` and persisting strata tables to `store`.
    pub fn new(
        source: Arc<dyn StratumSource>,
        store: Arc<dyn StratumTableStore>,
        config: SessionConfig,
    ) -> Result<Self, SamplerError> {
        Ok(Self {
            source,
            store,
            config: config.validated()?,
            strata: None,
            allocation: None,
            sample_strata: None,
            actual_captured: 0,
            materialize_request: None,
            materialize_summary: None,
        })
    }

    /// Session where one in-memory source serves counts, samples, and strata tables.
    pub fn in_memory(source: Arc<InMemorySource>, config: SessionConfig) -> Result<Self, SamplerError> {
        let store: Arc<dyn StratumTableStore> = source.clone();
        Self::new(source, store, config)
    }

    /// Active configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Minimum observations for a stratum to be sampled.
    pub fn min_count(&self) -> u64 {
        self.config.min_count
    }

    /// Maximum sampling rate for any stratum.
    pub fn sample_cap(&self) -> f64 {
        self.config.sample_cap
    }

    /// Desired sample size.
    pub fn target_total(&self) -> u64 {
        self.config.target_total
    }

    /// Change the minimum stratum size. Discards all derived state.
    pub fn set_min_count(&mut self, min_count: u64) {
        self.config.min_count = min_count;
        self.reset();
    }

    /// Change the sampling cap. Rejects caps outside `(0, 1]` and keeps the
    /// previous state in that case; otherwise discards all derived state.
    pub fn set_sample_cap(&mut self, cap: f64) -> Result<(), SamplerError> {
        self.config.sample_cap = validate_cap(cap)?;
        self.reset();
        Ok(())
    }

    /// Change the target sample size. Discards all derived state on success.
    pub fn set_target_total(&mut self, target_total: u64) -> Result<(), SamplerError> {
        AllocationConfig {
            target_total,
            ..self.config.allocation()
        }
        .validated()?;
        self.config.target_total = target_total;
        self.reset();
        Ok(())
    }

    /// Stratify the source relation by `fields` and allocate sampling rates.
    ///
    /// Prior results are discarded before any work starts, so a failure leaves
    /// the session with no strata rather than stale ones.
    pub fn calc_rates<I, F>(&mut self, fields: I) -> Result<&AllocationResult, SamplerError>
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldName>,
    {
        self.reset();
        let request = CountsRequest::new(
            self.config.source_relation.clone(),
            fields,
            self.config.stratum_options(),
        );
        if request.fields.is_empty() {
            return Err(SamplerError::Configuration(
                "must specify at least one stratification field".to_string(),
            ));
        }
        let mut strata = self
            .source
            .stratum_counts(&request)?
            .into_stratum_set(request.options())?;
        info!(
            source = self.source.id(),
            relation = %request.relation,
            strata = strata.len(),
            total_count = strata.total_count(),
            "stratified source relation"
        );

        let allocation = RateAllocator::new(self.config.allocation())?.calc_rates(&strata)?;
        strata.apply_rates(&allocation.rates)?;
        info!(
            target_total = allocation.target_total,
            expected_captured = allocation.expected_captured,
            iterations = allocation.iterations,
            saturated = allocation.saturated_count,
            "allocated sampling rates"
        );

        self.strata = Some(strata);
        Ok(self.allocation.insert(allocation))
    }

    /// Persist the strata table, materialize the sample, and stratify the sample.
    ///
    /// The strata table is written first; if that fails the sample is never
    /// materialized.
    pub fn make_table(&mut self) -> Result<&MaterializeSummary, SamplerError> {
        let strata = self.strata.as_ref().ok_or_else(|| {
            SamplerError::Configuration("must run calc_rates before make_table".to_string())
        })?;
        self.sample_strata = None;
        self.actual_captured = 0;
        self.materialize_request = None;
        self.materialize_summary = None;

        let table = self
            .store
            .persist_stratum_table(strata, &self.config.strata_table)?;
        info!(
            table = %table.name,
            rows = table.len(),
            "persisted strata table"
        );

        let request = MaterializeRequest {
            source_relation: self.config.source_relation.clone(),
            strata_table: table.name.clone(),
            stratum_fields: strata.fields().iter().map(|field| field.name.clone()).collect(),
            destination: self.config.sample_table.clone(),
        };
        let summary = self.source.materialize_sample(&request, &table)?;

        let sample_strata = self
            .source
            .stratum_counts(&CountsRequest::new(
                self.config.sample_table.clone(),
                request.stratum_fields.clone(),
                self.sample_options(),
            ))?
            .into_stratum_set(self.sample_options())?;
        self.actual_captured = sample_strata.total_count();
        info!(
            destination = %summary.destination,
            expected_captured = self.expected_captured(),
            actual_captured = self.actual_captured,
            "stratified sample table"
        );

        self.sample_strata = Some(sample_strata);
        self.materialize_request = Some(request);
        Ok(self.materialize_summary.insert(summary))
    }

    /// Run `calc_rates` then `make_table`.
    pub fn run<I, F>(&mut self, fields: I) -> Result<&MaterializeSummary, SamplerError>
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldName>,
    {
        self.calc_rates(fields)?;
        self.make_table()
    }

    /// Single-field distributions of the sample table, one per stratification field.
    pub fn marginals(&self) -> Result<(Vec<StratumSet>, ReportText), SamplerError> {
        let (Some(strata), Some(_)) = (&self.strata, &self.sample_strata) else {
            return Err(SamplerError::Configuration(
                "must run make_table before computing marginals".to_string(),
            ));
        };
        let marginals = strata
            .fields()
            .iter()
            .map(|field| {
                self.source
                    .stratum_counts(&CountsRequest::new(
                        self.config.sample_table.clone(),
                        [field.name.clone()],
                        self.sample_options(),
                    ))?
                    .into_stratum_set(self.sample_options())
            })
            .collect::<Result<Vec<_>, _>>()?;
        let text = render_marginals(&marginals);
        Ok((marginals, text))
    }

    /// Expected versus realized capture per stratum, once the sample exists.
    pub fn balance(&self) -> Option<BalanceComparison> {
        Some(compare_balance(
            self.strata.as_ref()?,
            self.sample_strata.as_ref()?,
        ))
    }

    /// Strata of the source relation with their assigned rates.
    pub fn strata(&self) -> Option<&StratumSet> {
        self.strata.as_ref()
    }

    /// Strata of the materialized sample table.
    pub fn sample_strata(&self) -> Option<&StratumSet> {
        self.sample_strata.as_ref()
    }

    /// Sampling rates aligned with `strata()` order.
    pub fn sample_rates(&self) -> Option<&[f64]> {
        self.allocation.as_ref().map(|result| result.rates.as_slice())
    }

    /// Full result of the last allocation.
    pub fn allocation(&self) -> Option<&AllocationResult> {
        self.allocation.as_ref()
    }

    /// Expected sample size from the last allocation, `0` before one runs.
    pub fn expected_captured(&self) -> u64 {
        self.allocation
            .as_ref()
            .map_or(0, |result| result.expected_captured)
    }

    /// Realized sample size, `0` before materialization.
    pub fn actual_captured(&self) -> u64 {
        self.actual_captured
    }

    /// Description of the last materialization.
    pub fn materialize_request(&self) -> Option<&MaterializeRequest> {
        self.materialize_request.as_ref()
    }

    /// Outcome of the last materialization.
    pub fn materialize_summary(&self) -> Option<&MaterializeSummary> {
        self.materialize_summary.as_ref()
    }

    fn sample_options(&self) -> StratumOptions {
        StratumOptions {
            min_count: 0,
            sort_mode: self.config.sort_mode,
        }
    }

    fn reset(&mut self) {
        self.strata = None;
        self.allocation = None;
        self.sample_strata = None;
        self.actual_captured = 0;
        self.materialize_request = None;
        self.materialize_summary = None;
    }
}

impl fmt::Display for SamplingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marginals = self
            .sample_strata
            .as_ref()
            .map(|_| match self.marginals() {
                Ok((_, text)) => text,
                Err(_) => "ERROR".to_string(),
            });
        let report = SessionReport {
            strata_table: &self.config.strata_table,
            sample_table: &self.config.sample_table,
            min_count: self.config.min_count,
            sample_cap: self.config.sample_cap,
            target_total: self.config.target_total,
            strata: self.strata.as_ref(),
            expected_captured: self.expected_captured(),
            actual_captured: self.actual_captured,
            sample_strata: self.sample_strata.as_ref(),
            marginals,
        };
        write!(f, "{report}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{FieldKind, FieldSpec, Value};
    use crate::source::Table;
    use crate::store::StratumTable;

    fn population() -> Arc<InMemorySource> {
        let mut table = Table::new(vec![
            FieldSpec::new("state", FieldKind::Text),
            FieldSpec::new("purpose", FieldKind::Text),
            FieldSpec::new("balance", FieldKind::Float),
        ]);
        let groups = [("CA", "P", 400), ("CA", "R", 120), ("TX", "P", 60), ("AZ", "P", 6)];
        for (state, purpose, n) in groups {
            for i in 0..n {
                table
                    .push_row(vec![
                        Value::Text(state.into()),
                        Value::Text(purpose.into()),
                        Value::Float(1000.0 * i as f64),
                    ])
                    .unwrap();
            }
        }
        let source = Arc::new(InMemorySource::with_seed("loans", 11));
        source.insert_table("loans", table).unwrap();
        source
    }

    fn config(target_total: u64) -> SessionConfig {
        SessionConfig {
            source_relation: "loans".into(),
            sample_table: "loans_sample".into(),
            strata_table: "loans_strata".into(),
            target_total,
            ..SessionConfig::default()
        }
    }

    struct FailingStore;

    impl StratumTableStore for FailingStore {
        fn persist_stratum_table(
            &self,
            _set: &StratumSet,
            _table: &str,
        ) -> Result<StratumTable, SamplerError> {
            Err(SamplerError::StratumStore("disk full".into()))
        }

        fn load_stratum_table(&self, _table: &str) -> Result<Option<StratumTable>, SamplerError> {
            Ok(None)
        }
    }

    #[test]
    fn calc_rates_attaches_rates_to_strata() {
        let mut session = SamplingSession::in_memory(population(), config(100)).unwrap();
        let result = session.calc_rates(["state"]).unwrap();
        assert_eq!(result.rates.len(), 3);
        let strata = session.strata().unwrap();
        assert!(strata.has_rates());
        assert_eq!(strata.rates(), session.sample_rates().unwrap());
        // AZ supplies all 6 rows, the rest split the remainder.
        let az = strata.strata().iter().find(|s| s.key.to_string() == "AZ").unwrap();
        assert_eq!(az.rate, 1.0);
        assert_eq!(az.captured, 6);
        assert!(session.expected_captured() >= 99);
    }

    #[test]
    fn make_table_requires_rates() {
        let mut session = SamplingSession::in_memory(population(), config(100)).unwrap();
        let err = session.make_table().unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
        assert!(session.marginals().is_err());
    }

    #[test]
    fn run_materializes_and_stratifies_sample() {
        let source = population();
        let mut session = SamplingSession::in_memory(source.clone(), config(90)).unwrap();
        let summary = session.run(["state", "purpose"]).unwrap().clone();
        assert_eq!(summary.source_rows, 586);
        assert_eq!(summary.unmatched_rows, 0);

        let sample = source.table("loans_sample").unwrap().unwrap();
        assert_eq!(sample.len() as u64, summary.retained_rows);
        assert_eq!(session.actual_captured(), summary.retained_rows);
        assert!(source.table("loans_strata").unwrap().is_some());

        let request = session.materialize_request().unwrap();
        assert_eq!(request.strata_table, "loans_strata");
        assert_eq!(request.stratum_fields, vec!["state", "purpose"]);

        // AZ:P is taken whole.
        let sample_strata = session.sample_strata().unwrap();
        let az = sample_strata
            .strata()
            .iter()
            .find(|s| s.key.to_string() == "AZ:P")
            .unwrap();
        assert_eq!(az.count, 6);

        let balance = session.balance().unwrap();
        assert_eq!(balance.actual_total, session.actual_captured());
    }

    #[test]
    fn min_count_excludes_small_strata_from_sample() {
        let source = population();
        let mut session = SamplingSession::in_memory(source.clone(), config(50)).unwrap();
        session.set_min_count(10);
        let summary = session.run(["state"]).unwrap().clone();
        assert_eq!(summary.unmatched_rows, 6);
        let sample = session.sample_strata().unwrap();
        assert!(sample.strata().iter().all(|s| s.key.to_string() != "AZ"));
    }

    #[test]
    fn marginals_cover_each_field() {
        let mut session = SamplingSession::in_memory(population(), config(80)).unwrap();
        session.run(["state", "purpose"]).unwrap();
        let (marginals, text) = session.marginals().unwrap();
        assert_eq!(marginals.len(), 2);
        assert_eq!(marginals[0].field_names(), vec!["state"]);
        assert_eq!(marginals[1].field_names(), vec!["purpose"]);
        assert_eq!(marginals[0].total_count(), session.actual_captured());
        assert!(text.contains("Marginal Distribution of state"));
        assert!(text.contains("Marginal Distribution of purpose"));
    }

    #[test]
    fn parameter_changes_invalidate_results() {
        let mut session = SamplingSession::in_memory(population(), config(80)).unwrap();
        session.run(["state"]).unwrap();
        assert!(session.sample_strata().is_some());

        assert!(session.set_sample_cap(1.5).is_err());
        assert!(session.strata().is_some());

        session.set_sample_cap(0.5).unwrap();
        assert!(session.strata().is_none());
        assert!(session.sample_strata().is_none());
        assert!(session.materialize_request().is_none());
        assert_eq!(session.expected_captured(), 0);
        assert_eq!(session.actual_captured(), 0);

        session.calc_rates(["state"]).unwrap();
        session.set_target_total(40).unwrap();
        assert!(session.allocation().is_none());
        assert!(session.set_target_total(u64::MAX).is_err());
        assert_eq!(session.target_total(), 40);
    }

    #[test]
    fn persistence_failure_prevents_materialization() {
        let source = population();
        let mut session =
            SamplingSession::new(source.clone(), Arc::new(FailingStore), config(50)).unwrap();
        session.calc_rates(["state"]).unwrap();
        let err = session.make_table().unwrap_err();
        assert!(matches!(err, SamplerError::StratumStore(_)));
        assert!(source.table("loans_sample").unwrap().is_none());
        assert!(session.sample_strata().is_none());
    }

    #[test]
    fn calc_rates_rejects_float_fields_and_empty_field_lists() {
        let mut session = SamplingSession::in_memory(population(), config(50)).unwrap();
        let err = session.calc_rates(["balance"]).unwrap_err();
        assert!(matches!(err, SamplerError::InvalidFieldType { .. }));
        let err = session.calc_rates(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, SamplerError::Configuration(_)));
    }

    #[test]
    fn min_count_above_every_stratum_is_empty_stratification() {
        let mut session = SamplingSession::in_memory(population(), config(50)).unwrap();
        session.set_min_count(10_000);
        let err = session.calc_rates(["state"]).unwrap_err();
        assert!(matches!(err, SamplerError::EmptyStratification));
        assert!(session.strata().is_none());
    }

    #[test]
    fn display_includes_sample_and_input_sections() {
        let mut session = SamplingSession::in_memory(population(), config(80)).unwrap();
        let before = session.to_string();
        assert!(before.starts_with("Strats Table: loans_strata\n"));
        assert!(!before.contains("Target # Obs"));

        session.run(["state"]).unwrap();
        let after = session.to_string();
        assert!(after.contains("Target # Obs: 80"));
        assert!(after.contains("Sample Table Strats"));
        assert!(after.contains("Marginal Distribution of state"));
        assert!(after.contains("Input Table Strats:"));
    }
}
