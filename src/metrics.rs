use std::collections::HashMap;

use crate::key::StratumKey;
use crate::strata::StratumSet;

/// Aggregate skew metrics over per-stratum counts.
#[derive(Clone, Debug, PartialEq)]
pub struct StratumSkew {
    pub total: u64,
    pub strata: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub max_share: f64,
    pub min_share: f64,
    pub ratio: f64,
    pub per_stratum: Vec<StratumShare>,
}

/// Per-stratum share of a set for skew inspection.
#[derive(Clone, Debug, PartialEq)]
pub struct StratumShare {
    pub key: StratumKey,
    pub count: u64,
    pub share: f64,
}

/// Compute skew metrics from the counts of `set`.
/// Returns `None` for an empty set.
pub fn stratum_skew(set: &StratumSet) -> Option<StratumSkew> {
    let counts = set.counts();
    let min = *counts.iter().min()?;
    let max = *counts.iter().max()?;
    let total = set.total_count();
    let strata = counts.len();
    let mean = total as f64 / strata as f64;
    let share_of = |count: u64| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        }
    };
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_stratum = set
        .strata()
        .iter()
        .map(|stratum| StratumShare {
            key: stratum.key.clone(),
            count: stratum.count,
            share: share_of(stratum.count),
        })
        .collect::<Vec<_>>();
    per_stratum.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    Some(StratumSkew {
        total,
        strata,
        min,
        max,
        mean,
        max_share: share_of(max),
        min_share: share_of(min),
        ratio,
        per_stratum,
    })
}

/// Expected versus realized capture for one stratum.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceRow {
    pub key: StratumKey,
    pub expected: u64,
    pub actual: u64,
}

impl BalanceRow {
    /// Realized minus expected rows.
    pub fn delta(&self) -> i128 {
        self.actual as i128 - self.expected as i128
    }
}

/// Per-stratum comparison of an allocated set against a realized sample.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceComparison {
    pub rows: Vec<BalanceRow>,
    pub expected_total: u64,
    pub actual_total: u64,
}

impl BalanceComparison {
    /// Largest absolute per-stratum deviation.
    pub fn max_abs_delta(&self) -> u128 {
        self.rows
            .iter()
            .map(|row| row.delta().unsigned_abs())
            .max()
            .unwrap_or(0)
    }
}

/// Compare the expected captures of `allocated` with the counts of `realized`.
///
/// Rows follow `allocated` order; strata absent from the realized sample
/// report an actual of zero.
pub fn compare_balance(allocated: &StratumSet, realized: &StratumSet) -> BalanceComparison {
    let actual_by_key = realized
        .strata()
        .iter()
        .map(|stratum| (&stratum.key, stratum.count))
        .collect::<HashMap<_, _>>();
    let rows = allocated
        .strata()
        .iter()
        .map(|stratum| BalanceRow {
            key: stratum.key.clone(),
            expected: stratum.captured,
            actual: actual_by_key.get(&stratum.key).copied().unwrap_or(0),
        })
        .collect::<Vec<_>>();
    BalanceComparison {
        expected_total: rows.iter().map(|row| row.expected).sum(),
        actual_total: realized.total_count(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumOptions;
    use crate::key::{FieldKind, FieldSpec};

    fn set(rows: &[(&str, u64)]) -> StratumSet {
        StratumSet::build(
            vec![FieldSpec::new("state", FieldKind::Text)],
            rows.iter()
                .map(|(state, count)| (StratumKey::new(vec![(*state).into()]), *count)),
            StratumOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn stratum_skew_reports_balance() {
        let skew = stratum_skew(&set(&[("A", 2), ("B", 2)])).expect("skew");
        assert_eq!(skew.total, 4);
        assert_eq!(skew.strata, 2);
        assert!((skew.max_share - 0.5).abs() < 1e-6);
        assert!((skew.ratio - 1.0).abs() < 1e-6);
        assert!(
            skew.per_stratum
                .iter()
                .all(|entry| (entry.share - 0.5).abs() < 1e-6)
        );
    }

    #[test]
    fn stratum_skew_reports_imbalance() {
        let skew = stratum_skew(&set(&[("A", 4), ("B", 2), ("C", 2)])).expect("skew");
        assert_eq!(skew.total, 8);
        assert_eq!(skew.min, 2);
        assert_eq!(skew.max, 4);
        assert!((skew.ratio - 2.0).abs() < 1e-6);
        assert_eq!(skew.per_stratum[0].key.to_string(), "A");
        assert_eq!(skew.per_stratum[1].key.to_string(), "B");
    }

    #[test]
    fn stratum_skew_is_none_for_empty_sets() {
        assert!(stratum_skew(&set(&[])).is_none());
    }

    #[test]
    fn compare_balance_matches_by_key() {
        let mut allocated = set(&[("A", 100), ("B", 10), ("C", 5)]);
        allocated.apply_rates(&[0.3, 1.0, 1.0]).unwrap();
        let realized = set(&[("A", 28), ("B", 10)]);
        let comparison = compare_balance(&allocated, &realized);
        assert_eq!(comparison.expected_total, 45);
        assert_eq!(comparison.actual_total, 38);
        assert_eq!(comparison.rows[0].delta(), -2);
        assert_eq!(comparison.rows[2].actual, 0);
        assert_eq!(comparison.max_abs_delta(), 5);
    }
}
