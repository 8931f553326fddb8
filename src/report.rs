//! Text rendering of stratum sets and session summaries.

use std::fmt;

use crate::constants::report::{COLUMN_SPACES, COUNT_HEADER, MAX_SHOW};
use crate::strata::StratumSet;
use crate::types::{ReportText, TableName};

/// Group decimal digits with commas, e.g. `1234567` -> `1,234,567`.
pub fn format_u128_with_commas(value: u128) -> String {
    let raw = value.to_string();
    let mut grouped_reversed = String::with_capacity(raw.len() + (raw.len() / 3));
    for (idx, ch) in raw.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            grouped_reversed.push(',');
        }
        grouped_reversed.push(ch);
    }
    grouped_reversed.chars().rev().collect()
}

fn padder(text: &str, pad_to: usize, append: bool) -> String {
    let width = text.chars().count();
    let fill = " ".repeat(pad_to.saturating_sub(width));
    if append {
        format!("{text}{fill}")
    } else {
        format!("{fill}{text}")
    }
}

impl fmt::Display for StratumSet {
    /// Column-aligned table of keys and counts.
    ///
    /// Shows the first and last `MAX_SHOW` rows; longer sets elide the middle.
    /// An empty set renders as an empty string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let cells = self
            .strata()
            .iter()
            .map(|stratum| {
                stratum
                    .key
                    .values()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let counts = self
            .strata()
            .iter()
            .map(|stratum| format_u128_with_commas(stratum.count as u128))
            .collect::<Vec<_>>();

        let mut widths = self
            .field_names()
            .iter()
            .map(|name| name.chars().count() + COLUMN_SPACES)
            .collect::<Vec<_>>();
        for row in &cells {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count() + COLUMN_SPACES);
            }
        }
        let count_width = counts
            .iter()
            .map(|count| count.chars().count())
            .fold(COLUMN_SPACES, usize::max);

        for (name, width) in self.field_names().iter().zip(&widths) {
            write!(f, "{}", padder(name, *width, true))?;
        }
        writeln!(f, "{}", padder(COUNT_HEADER, count_width + COLUMN_SPACES, true))?;

        let write_row = |f: &mut fmt::Formatter<'_>, row: usize| -> fmt::Result {
            for (cell, width) in cells[row].iter().zip(&widths) {
                write!(f, "{}", padder(cell, *width, true))?;
            }
            let count = padder(&counts[row], count_width, false);
            writeln!(f, "{}", padder(&count, count_width + COLUMN_SPACES, true))
        };

        let n = self.len();
        let indent = " ".repeat(COLUMN_SPACES);
        for row in 0..n.min(MAX_SHOW) {
            write_row(f, row)?;
        }
        if n > MAX_SHOW {
            if n > 2 * MAX_SHOW {
                writeln!(f, "{indent}....")?;
            }
            let start = n.saturating_sub(MAX_SHOW).max(MAX_SHOW);
            for row in start..n {
                write_row(f, row)?;
            }
        }
        if n > 2 * MAX_SHOW {
            writeln!(f, "{indent}{} rows not shown", n - 2 * MAX_SHOW)?;
        }
        write!(f, "{indent}{} total obs", self.total_count())
    }
}

/// Render one marginal distribution per field.
pub fn render_marginals(marginals: &[StratumSet]) -> ReportText {
    let mut out = String::new();
    for set in marginals {
        out.push_str(&format!(
            "\nMarginal Distribution of {}\n{set}\n",
            set.field_names().join(":")
        ));
    }
    out
}

/// Borrowed view of a session's state for the summary report.
#[derive(Clone, Debug)]
pub struct SessionReport<'a> {
    pub strata_table: &'a TableName,
    pub sample_table: &'a TableName,
    pub min_count: u64,
    pub sample_cap: f64,
    pub target_total: u64,
    pub strata: Option<&'a StratumSet>,
    pub expected_captured: u64,
    pub actual_captured: u64,
    pub sample_strata: Option<&'a StratumSet>,
    pub marginals: Option<ReportText>,
}

impl fmt::Display for SessionReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Strats Table: {}", self.strata_table)?;
        writeln!(f, "Sample Table: {}", self.sample_table)?;
        writeln!(
            f,
            "Min Count: {}",
            format_u128_with_commas(self.min_count as u128)
        )?;
        writeln!(f, "Sampling Cap: {:.2}", self.sample_cap)?;
        let Some(strata) = self.strata else {
            return Ok(());
        };
        writeln!(f)?;
        writeln!(
            f,
            "Target # Obs: {}",
            format_u128_with_commas(self.target_total as u128)
        )?;
        write!(
            f,
            "Expected # Obs: {}",
            format_u128_with_commas(self.expected_captured as u128)
        )?;
        if let Some(sample) = self.sample_strata {
            writeln!(f)?;
            writeln!(
                f,
                "Actual # Obs: {}",
                format_u128_with_commas(self.actual_captured as u128)
            )?;
            writeln!(f)?;
            writeln!(f, "Sample Table Strats")?;
            write!(f, "{sample}")?;
            if let Some(marginals) = &self.marginals {
                write!(f, "\n{marginals}")?;
            }
        }
        writeln!(f)?;
        writeln!(f, "Input Table Strats:")?;
        write!(f, "\n{strata}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StratumOptions;
    use crate::key::{FieldKind, FieldSpec, StratumKey};
    use chrono::NaiveDate;

    fn numbered(n: u64) -> StratumSet {
        StratumSet::build(
            vec![FieldSpec::new("bucket", FieldKind::Int64)],
            (0..n).map(|i| (StratumKey::new(vec![(i as i64).into()]), 1000 + i)),
            StratumOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn formats_commas() {
        assert_eq!(format_u128_with_commas(0), "0");
        assert_eq!(format_u128_with_commas(999), "999");
        assert_eq!(format_u128_with_commas(1_000), "1,000");
        assert_eq!(format_u128_with_commas(12_345_678), "12,345,678");
    }

    #[test]
    fn renders_aligned_columns_with_dates() {
        let set = StratumSet::build(
            vec![
                FieldSpec::new("vintage", FieldKind::Date),
                FieldSpec::new("state", FieldKind::Text),
            ],
            vec![
                (
                    StratumKey::new(vec![
                        NaiveDate::from_ymd_opt(2021, 3, 1).unwrap().into(),
                        "CA".into(),
                    ]),
                    12_500,
                ),
                (
                    StratumKey::new(vec![
                        NaiveDate::from_ymd_opt(2022, 7, 1).unwrap().into(),
                        "TX".into(),
                    ]),
                    40,
                ),
            ],
            StratumOptions::default(),
        )
        .unwrap();
        let text = set.to_string();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "vintage       state    Count     ");
        assert_eq!(lines[1], "2021-03-01    CA       12,500    ");
        assert_eq!(lines[2], "2022-07-01    TX           40    ");
        assert_eq!(lines[3], "    12540 total obs");
    }

    #[test]
    fn short_tables_show_every_row() {
        let text = numbered(15).to_string();
        assert!(!text.contains("...."));
        assert!(!text.contains("rows not shown"));
        // header + 15 rows + total
        assert_eq!(text.lines().count(), 17);
    }

    #[test]
    fn long_tables_elide_the_middle() {
        let text = numbered(25).to_string();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1 + 10 + 1 + 10 + 2);
        assert_eq!(lines[11], "    ....");
        assert!(lines[12].starts_with("15 "));
        assert_eq!(lines[22], "    5 rows not shown");
        assert!(lines[23].ends_with("total obs"));
    }

    #[test]
    fn empty_sets_render_nothing() {
        assert_eq!(numbered(0).to_string(), "");
    }

    #[test]
    fn session_report_stops_before_allocation() {
        let strata_table = "strats".to_string();
        let sample_table = "sample".to_string();
        let report = SessionReport {
            strata_table: &strata_table,
            sample_table: &sample_table,
            min_count: 1500,
            sample_cap: 1.0,
            target_total: 100,
            strata: None,
            expected_captured: 0,
            actual_captured: 0,
            sample_strata: None,
            marginals: None,
        };
        assert_eq!(
            report.to_string(),
            "Strats Table: strats\nSample Table: sample\nMin Count: 1,500\nSampling Cap: 1.00\n"
        );
    }
}
