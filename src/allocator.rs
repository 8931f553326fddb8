//! Per-stratum sampling-rate allocation.
//!
//! The target total is split evenly across the strata still able to supply
//! rows. Strata that cannot supply their even share (too few rows, or the
//! rate cap binds) are saturated: they keep what they supplied and drop out,
//! and the unplaced quota is redistributed over the remaining free strata in
//! the next round. Rounds stop once the unplaced quota is within tolerance,
//! no free strata remain, or the iteration bound is hit.
//!
//! The allocator is deterministic and performs no I/O.

use tracing::{debug, warn};

use crate::config::AllocationConfig;
use crate::constants::allocator::CAPTURE_EPSILON;
use crate::errors::SamplerError;
use crate::strata::StratumSet;

/// State at the end of one allocation round.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationRound {
    /// 1-based round number.
    pub iteration: usize,
    /// Even share each free stratum was asked to supply this round.
    pub per_stratum: f64,
    /// Quota saturated strata could not supply this round.
    pub lost_observations: f64,
    /// Free strata remaining after the round.
    pub free: usize,
    /// Cumulative observations allocated so far.
    pub captured_total: f64,
    /// Cumulative rates after the round, aligned with the stratum set.
    pub rates: Vec<f64>,
}

/// Outcome of one allocation run.
#[derive(Clone, Debug, PartialEq)]
pub struct AllocationResult {
    /// Sampling rate per stratum, aligned with the stratum set order.
    pub rates: Vec<f64>,
    /// Expected sample size implied by the rates.
    pub expected_captured: u64,
    /// Rounds executed.
    pub iterations: usize,
    /// Strata saturated by the cap or by running out of rows.
    pub saturated_count: usize,
    /// Target total the run aimed for.
    pub target_total: u64,
    /// Per-round trace.
    pub rounds: Vec<AllocationRound>,
}

impl AllocationResult {
    /// Strata still free when allocation stopped.
    pub fn free_count(&self) -> usize {
        self.rates.len() - self.saturated_count
    }

    /// Observations the expected sample falls short of the target.
    pub fn shortfall(&self) -> u64 {
        self.target_total.saturating_sub(self.expected_captured)
    }
}

/// Computes sampling rates for a stratum set under a validated configuration.
#[derive(Clone, Copy, Debug)]
pub struct RateAllocator {
    config: AllocationConfig,
}

impl RateAllocator {
    /// Create an allocator, rejecting out-of-range configuration.
    pub fn new(config: AllocationConfig) -> Result<Self, SamplerError> {
        Ok(Self {
            config: config.validated()?,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Compute rates for every stratum of `set`.
    ///
    /// Returns `EmptyStratification` when `set` has no strata. The set itself
    /// is not modified; attach the result with [`StratumSet::apply_rates`].
    pub fn calc_rates(&self, set: &StratumSet) -> Result<AllocationResult, SamplerError> {
        if set.is_empty() {
            return Err(SamplerError::EmptyStratification);
        }
        let counts = set
            .strata()
            .iter()
            .map(|stratum| {
                if stratum.count == 0 {
                    return Err(SamplerError::InvalidStratum(format!(
                        "stratum '{}' has zero observations",
                        stratum.key
                    )));
                }
                Ok(stratum.count as f64)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cap = self.config.cap;
        let target = self.config.target_total as f64;
        let tolerance = self.config.tolerance * target;

        let mut rates = vec![0.0_f64; counts.len()];
        let mut saturated = vec![false; counts.len()];
        let mut free = counts.len();
        let mut remaining = target;
        let mut captured_total = 0.0_f64;
        let mut rounds = Vec::new();

        loop {
            let per_stratum = remaining / free as f64;
            let mut lost = 0.0_f64;

            for (idx, &count) in counts.iter().enumerate() {
                if saturated[idx] {
                    continue;
                }
                let mut proposed = per_stratum / count;
                let clipped = rates[idx] + proposed > cap;
                if clipped {
                    proposed = cap - rates[idx];
                }
                let supplied = proposed * count;
                captured_total += supplied;
                rates[idx] = if clipped { cap } else { rates[idx] + proposed };

                // A stratum smaller than its share is exhausted even if the
                // rate did not land exactly on the cap.
                if clipped || count < per_stratum {
                    saturated[idx] = true;
                    free -= 1;
                    lost += (per_stratum - supplied).max(0.0);
                }
            }

            remaining = (target - captured_total).max(0.0);
            let iteration = rounds.len() + 1;
            debug!(
                iteration,
                per_stratum,
                lost_observations = lost,
                free,
                captured_total,
                "allocation round"
            );
            rounds.push(AllocationRound {
                iteration,
                per_stratum,
                lost_observations: lost,
                free,
                captured_total,
                rates: rates.clone(),
            });

            if !(iteration < self.config.max_iterations && lost > tolerance && free > 0) {
                break;
            }
        }

        let expected_captured =
            ((captured_total + CAPTURE_EPSILON).floor() as u64).min(self.config.target_total);
        if (self.config.target_total - expected_captured) as f64 > tolerance {
            warn!(
                target_total = self.config.target_total,
                expected_captured,
                free,
                "allocation stopped short of target"
            );
        }

        Ok(AllocationResult {
            rates,
            expected_captured,
            iterations: rounds.len(),
            saturated_count: counts.len() - free,
            target_total: self.config.target_total,
            rounds,
        })
    }
}

/// Run a single allocation with `config` over `set`.
pub fn calc_rates(
    set: &StratumSet,
    config: AllocationConfig,
) -> Result<AllocationResult, SamplerError> {
    RateAllocator::new(config)?.calc_rates(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumOptions;
    use crate::key::{FieldKind, FieldSpec, StratumKey};

    fn set_from_counts(counts: &[u64]) -> StratumSet {
        let rows = counts
            .iter()
            .enumerate()
            .map(|(idx, count)| (StratumKey::new(vec![(idx as i64).into()]), *count));
        StratumSet::build(
            vec![FieldSpec::new("bucket", FieldKind::Int64)],
            rows,
            StratumOptions::default(),
        )
        .unwrap()
    }

    fn config(target_total: u64, cap: f64) -> AllocationConfig {
        AllocationConfig {
            target_total,
            cap,
            ..AllocationConfig::default()
        }
    }

    #[test]
    fn small_stratum_saturates_and_large_absorbs_remainder() {
        let set = set_from_counts(&[100, 10]);
        let result = calc_rates(&set, config(40, 1.0)).unwrap();
        assert!((result.rates[0] - 0.30).abs() < 1e-9);
        assert_eq!(result.rates[1], 1.0);
        assert_eq!(result.expected_captured, 40);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.saturated_count, 1);
        assert_eq!(result.rounds[0].free, 1);
        assert!((result.rounds[0].lost_observations - 10.0).abs() < 1e-9);

        let mut set = set;
        set.apply_rates(&result.rates).unwrap();
        assert_eq!(set.strata()[1].captured, 10);
        assert_eq!(set.strata()[0].captured, 30);
    }

    #[test]
    fn cap_binds_immediately_on_single_small_stratum() {
        let set = set_from_counts(&[5]);
        let result = calc_rates(&set, config(100, 0.5)).unwrap();
        assert_eq!(result.rates, vec![0.5]);
        assert_eq!(result.expected_captured, 2);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.free_count(), 0);
        assert_eq!(result.shortfall(), 98);
    }

    #[test]
    fn zero_target_yields_zero_rates_in_one_round() {
        let set = set_from_counts(&[7, 70, 700]);
        let result = calc_rates(&set, config(0, 1.0)).unwrap();
        assert!(result.rates.iter().all(|rate| *rate == 0.0));
        assert_eq!(result.expected_captured, 0);
        assert_eq!(result.iterations, 1);
        assert_eq!(result.saturated_count, 0);
    }

    #[test]
    fn abundant_strata_balance_in_one_round() {
        let set = set_from_counts(&[1000, 2000, 4000]);
        let result = calc_rates(&set, config(300, 1.0)).unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.expected_captured, 300);
        let captured = set
            .counts()
            .iter()
            .zip(&result.rates)
            .map(|(count, rate)| *count as f64 * rate)
            .collect::<Vec<_>>();
        assert!(captured.iter().all(|c| (c - 100.0).abs() < 1e-9));
    }

    #[test]
    fn cap_below_one_saturates_by_rate_alone() {
        // 50 per stratum would need rate 0.5 of 100 rows; cap 0.2 binds first.
        let set = set_from_counts(&[100, 10_000]);
        let result = calc_rates(&set, config(100, 0.2)).unwrap();
        assert_eq!(result.rates[0], 0.2);
        assert_eq!(result.rounds[0].free, 1);
        assert!(result.iterations >= 2);
        assert_eq!(result.expected_captured, 100);
    }

    #[test]
    fn free_reaching_zero_stops_before_iteration_bound() {
        let set = set_from_counts(&[3, 4, 5]);
        let result = calc_rates(&set, config(1000, 1.0)).unwrap();
        assert_eq!(result.iterations, 1);
        assert_eq!(result.free_count(), 0);
        assert_eq!(result.expected_captured, 12);
        assert!(result.rates.iter().all(|rate| *rate == 1.0));
    }

    #[test]
    fn iteration_bound_is_respected() {
        let counts = [1, 3, 9, 27, 81, 243, 729, 2187, 100_000];
        let set = set_from_counts(&counts);
        let bounded = AllocationConfig {
            max_iterations: 1,
            ..config(20_000, 1.0)
        };
        let result = calc_rates(&set, bounded).unwrap();
        assert_eq!(result.iterations, 1);
        assert!(result.rounds[0].lost_observations > 200.0);
        assert_eq!(result.free_count(), 1);
    }

    #[test]
    fn rejects_empty_set_and_bad_inputs() {
        let empty = StratumSet::build(
            vec![FieldSpec::new("bucket", FieldKind::Int64)],
            Vec::new(),
            StratumOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            calc_rates(&empty, config(10, 1.0)),
            Err(SamplerError::EmptyStratification)
        ));
        let set = set_from_counts(&[10]);
        assert!(matches!(
            calc_rates(&set, config(10, 0.0)),
            Err(SamplerError::InvalidCap(_))
        ));
        assert!(matches!(
            calc_rates(&set, config(10, 1.5)),
            Err(SamplerError::InvalidCap(_))
        ));
        assert!(matches!(
            calc_rates(&set, config(u64::MAX, 1.0)),
            Err(SamplerError::InvalidTarget(_))
        ));
    }

    #[test]
    fn repeated_runs_are_bitwise_identical() {
        let set = set_from_counts(&[13, 17, 4_001, 977, 2]);
        let allocator = RateAllocator::new(config(1_234, 0.8)).unwrap();
        let first = allocator.calc_rates(&set).unwrap();
        let second = allocator.calc_rates(&set).unwrap();
        let bits = |rates: &[f64]| rates.iter().map(|r| r.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&first.rates), bits(&second.rates));
        assert_eq!(first, second);
    }
}
