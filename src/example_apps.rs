use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, error::ErrorKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{SessionConfig, validate_cap};
use crate::constants::source::DEFAULT_SAMPLE_SEED;
use crate::key::{FieldKind, FieldSpec, Value};
use crate::metrics::stratum_skew;
use crate::report::format_u128_with_commas;
use crate::session::SamplingSession;
use crate::source::{InMemorySource, StratumSource, Table};
use crate::store::{FileStratumStore, StratumTableStore};
use crate::strata::SortMode;

const POPULATION_TABLE: &str = "loans";
const SAMPLE_TABLE: &str = "loans_sample";
const STRATA_TABLE: &str = "loans_strata";

const STATES: [(&str, u32); 6] = [
    ("CA", 40),
    ("TX", 22),
    ("FL", 18),
    ("NY", 12),
    ("AZ", 6),
    ("VT", 2),
];
const PURPOSES: [(&str, u32); 3] = [("P", 70), ("R", 25), ("C", 5)];
const TERMS: [(i32, u32); 3] = [(360, 75), (180, 20), (120, 5)];

#[derive(Debug, Parser)]
#[command(
    name = "loan_sample_demo",
    disable_help_subcommand = true,
    about = "Draw a stratified sample from a loan population",
    long_about = "Stratify a loan population by the chosen fields, allocate per-stratum sampling rates that balance the sample, and materialize it.",
    after_help = "Without --input a synthetic population is generated. Without a store option, strata tables stay in memory."
)]
/// CLI for `loan_sample_demo`.
///
/// Common usage:
/// - Balance on state and purpose: `--fields state,purpose --target 2000`
/// - Load a population from JSON lines: `--input loans.jsonl`
/// - Start from a session config file: `--config session.json`
/// - Persist strata tables to disk: `--store-dir /tmp/strata_store`
struct LoanSampleDemoCli {
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "state,purpose",
        help = "Comma-separated stratification fields (state, purpose, vintage, term)"
    )]
    fields: Vec<String>,
    #[arg(long, help = "Desired sample size (overrides the config file)")]
    target: Option<u64>,
    #[arg(
        long,
        value_parser = parse_cap_arg,
        help = "Maximum sampling rate for any stratum, in (0, 1]"
    )]
    cap: Option<f64>,
    #[arg(
        long = "min-count",
        help = "Drop strata with fewer observations than this"
    )]
    min_count: Option<u64>,
    #[arg(long = "sort-by-count", help = "Order strata by descending count")]
    sort_by_count: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_SAMPLE_SEED,
        help = "Seed for the synthetic population and per-row sampling draws"
    )]
    seed: u64,
    #[arg(
        long,
        default_value_t = 20_000,
        help = "Rows in the synthetic population"
    )]
    population: usize,
    #[arg(long, value_name = "PATH", help = "Optional session config JSON file")]
    config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Optional JSON-lines population (fields: state, purpose, vintage, term, fico)"
    )]
    input: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Optional JSON-lines destination for the sample table"
    )]
    export: Option<PathBuf>,
    #[arg(
        long = "store-path",
        value_name = "STORE_PATH",
        help = "Optional path for the persisted strata-table file"
    )]
    store_path: Option<PathBuf>,
    #[arg(
        long = "store-dir",
        value_name = "DIR",
        conflicts_with = "store_path",
        help = "Optional directory for the persisted strata-table file (uses strata_store.bin filename)"
    )]
    store_dir: Option<PathBuf>,
}

/// Column layout of the demo loan population.
pub fn loan_schema() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("state", FieldKind::Text),
        FieldSpec::new("purpose", FieldKind::Text),
        FieldSpec::new("vintage", FieldKind::Date),
        FieldSpec::new("term", FieldKind::Int32),
        FieldSpec::new("fico", FieldKind::Float),
    ]
}

/// Generate a skewed synthetic loan population of `rows` rows.
pub fn synthetic_loans(rows: usize, seed: u64) -> Result<Table, Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut table = Table::new(loan_schema());
    for _ in 0..rows {
        let quarter = rng.random_range(0..12u32);
        let vintage = NaiveDate::from_ymd_opt(2021 + (quarter / 4) as i32, 1 + 3 * (quarter % 4), 1)
            .ok_or("invalid vintage date")?;
        table.push_row(vec![
            Value::Text(weighted(&mut rng, &STATES).to_string()),
            Value::Text(weighted(&mut rng, &PURPOSES).to_string()),
            Value::Date(vintage),
            Value::Int32(weighted(&mut rng, &TERMS)),
            Value::Float(rng.random_range(580.0..820.0)),
        ])?;
    }
    Ok(table)
}

fn weighted<T: Copy>(rng: &mut StdRng, choices: &[(T, u32)]) -> T {
    let total: u32 = choices.iter().map(|(_, weight)| weight).sum();
    let mut pick = rng.random_range(0..total);
    for (value, weight) in choices {
        if pick < *weight {
            return *value;
        }
        pick -= weight;
    }
    choices[choices.len() - 1].0
}

/// Parse demo arguments, build the population, and run one sampling session.
pub fn run_loan_sample_demo<I>(args_iter: I) -> Result<(), Box<dyn Error>>
where
    I: Iterator<Item = String>,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let Some(cli) = parse_cli::<LoanSampleDemoCli, _>(
        std::iter::once("loan_sample_demo".to_string()).chain(args_iter),
    )?
    else {
        return Ok(());
    };

    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_json_file(path)?,
        None => SessionConfig {
            source_relation: POPULATION_TABLE.to_string(),
            sample_table: SAMPLE_TABLE.to_string(),
            strata_table: STRATA_TABLE.to_string(),
            target_total: 2_000,
            ..SessionConfig::default()
        },
    };
    if let Some(target) = cli.target {
        config.target_total = target;
    }
    if let Some(cap) = cli.cap {
        config.sample_cap = cap;
    }
    if let Some(min_count) = cli.min_count {
        config.min_count = min_count;
    }
    if cli.sort_by_count {
        config.sort_mode = SortMode::ByCountDesc;
    }

    let source = Arc::new(InMemorySource::with_seed("loans", cli.seed));
    let loaded = match &cli.input {
        Some(path) => source.load_json_lines(&config.source_relation, loan_schema(), path)?,
        None => {
            let table = synthetic_loans(cli.population, cli.seed)?;
            let rows = table.len();
            source.insert_table(&config.source_relation, table)?;
            rows
        }
    };
    println!(
        "Loaded {} rows into '{}'",
        format_u128_with_commas(loaded as u128),
        config.source_relation
    );

    let store_path = if let Some(path) = cli.store_path {
        Some(path)
    } else {
        cli.store_dir.map(FileStratumStore::default_path_in_dir)
    };
    let store: Arc<dyn StratumTableStore> = match &store_path {
        Some(path) => {
            println!("Persisting strata tables to {}", path.display());
            Arc::new(FileStratumStore::open(path)?)
        }
        None => source.clone(),
    };

    let sample_table = config.sample_table.clone();
    let mut session =
        SamplingSession::new(source.clone() as Arc<dyn StratumSource>, store, config)?;
    let summary = session.run(cli.fields.iter().map(String::as_str))?.clone();
    println!(
        "Kept {} of {} rows ({} outside sampled strata)\n",
        format_u128_with_commas(summary.retained_rows as u128),
        format_u128_with_commas(summary.source_rows as u128),
        format_u128_with_commas(summary.unmatched_rows as u128)
    );
    println!("{session}\n");

    if let Some(strata) = session.strata()
        && let Some(skew) = stratum_skew(strata)
    {
        println!(
            "Input skew: {} strata, min {}, max {}, max/min {:.2}",
            skew.strata, skew.min, skew.max, skew.ratio
        );
    }
    if let Some(sample) = session.sample_strata()
        && let Some(skew) = stratum_skew(sample)
    {
        println!(
            "Sample skew: {} strata, min {}, max {}, max/min {:.2}",
            skew.strata, skew.min, skew.max, skew.ratio
        );
    }
    if let Some(balance) = session.balance() {
        println!(
            "Largest per-stratum deviation from expected: {} rows",
            balance.max_abs_delta()
        );
    }

    if let Some(path) = cli.export {
        let rows = source.export_json_lines(&sample_table, &path)?;
        println!(
            "Exported {} sample rows to {}",
            format_u128_with_commas(rows as u128),
            path.display()
        );
    }

    Ok(())
}

fn parse_cap_arg(raw: &str) -> Result<f64, String> {
    let parsed = raw
        .parse::<f64>()
        .map_err(|_| format!("Could not parse --cap value '{raw}' as a number"))?;
    validate_cap(parsed).map_err(|err| err.to_string())
}

fn parse_cli<T, I>(args: I) -> Result<Option<T>, Box<dyn Error>>
where
    T: Parser,
    I: IntoIterator,
    I::Item: Into<std::ffi::OsString> + Clone,
{
    match T::try_parse_from(args) {
        Ok(cli) => Ok(Some(cli)),
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                err.print()?;
                Ok(None)
            }
            _ => Err(err.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CountsRequest;
    use crate::config::StratumOptions;
    use tempfile::tempdir;

    #[test]
    fn synthetic_population_is_seeded_and_skewed() {
        let first = synthetic_loans(2_000, 5).unwrap();
        let second = synthetic_loans(2_000, 5).unwrap();
        assert_eq!(first, second);

        let source = InMemorySource::new();
        source.insert_table("loans", first).unwrap();
        let counts = source
            .stratum_counts(&CountsRequest::new(
                "loans",
                ["state"],
                StratumOptions {
                    min_count: 0,
                    sort_mode: SortMode::ByCountDesc,
                },
            ))
            .unwrap();
        assert_eq!(counts.rows[0].0.to_string(), "CA");
    }

    #[test]
    fn demo_runs_end_to_end_with_file_store_and_export() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("sample.jsonl");
        let args = [
            "--population",
            "3000",
            "--target",
            "400",
            "--fields",
            "state,term",
            "--store-dir",
            dir.path().to_str().unwrap(),
            "--export",
            export.to_str().unwrap(),
        ]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
        run_loan_sample_demo(args.into_iter()).unwrap();
        assert!(export.exists());
        assert!(FileStratumStore::default_path_in_dir(dir.path()).exists());
    }

    #[test]
    fn rejects_out_of_range_cap() {
        assert!(parse_cap_arg("0").is_err());
        assert!(parse_cap_arg("1.5").is_err());
        assert_eq!(parse_cap_arg("0.25").unwrap(), 0.25);
    }

    #[test]
    fn help_is_not_an_error() {
        assert!(run_loan_sample_demo(["--help".to_string()].into_iter()).is_ok());
    }
}
