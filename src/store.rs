use chrono::{Datelike, NaiveDate};
use simd_r_drive::storage_engine::DataStore;
use simd_r_drive::storage_engine::traits::{DataStoreReader, DataStoreWriter};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::StratumOptions;
use crate::constants::store::{
    BITCODE_PREFIX, COUNT_COLUMN, DEFAULT_STORE_DIR, DEFAULT_STORE_FILENAME, RATE_COLUMN,
    TABLE_PREFIX, TABLE_RECORD_VERSION,
};
use crate::errors::SamplerError;
use crate::key::{FieldKind, FieldSpec, KeyValue, StratumKey};
use crate::strata::{SortMode, StratumSet};
use crate::types::TableName;

/// Column type of a persisted stratum table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub enum ColumnType {
    /// 32-bit integer key column.
    Int32,
    /// 64-bit integer column (keys and counts).
    Int64,
    /// Text key column.
    Text,
    /// Date key column.
    Date,
    /// Rate column.
    Float64,
}

impl ColumnType {
    fn for_key(value: &KeyValue) -> Self {
        match value {
            KeyValue::Int32(_) => ColumnType::Int32,
            KeyValue::Int64(_) => ColumnType::Int64,
            KeyValue::Text(_) => ColumnType::Text,
            KeyValue::Date(_) => ColumnType::Date,
        }
    }

    /// Source schema kind for this column.
    pub fn field_kind(self) -> FieldKind {
        match self {
            ColumnType::Int32 => FieldKind::Int32,
            ColumnType::Int64 => FieldKind::Int64,
            ColumnType::Text => FieldKind::Text,
            ColumnType::Date => FieldKind::Date,
            ColumnType::Float64 => FieldKind::Float,
        }
    }
}

/// Named, typed column of a persisted stratum table.
#[derive(Clone, Debug, PartialEq, Eq, bitcode::Encode, bitcode::Decode)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    pub column_type: ColumnType,
}

/// One persisted cell. Dates are stored as days since the common era.
#[derive(Clone, Debug, PartialEq, bitcode::Encode, bitcode::Decode)]
pub enum Cell {
    /// 32-bit integer.
    Int32(i32),
    /// 64-bit integer.
    Int64(i64),
    /// Text.
    Text(String),
    /// Days since 0001-01-01 (day 1).
    Date(i32),
    /// Float.
    Float64(f64),
}

impl Cell {
    fn from_key(value: &KeyValue) -> Self {
        match value {
            KeyValue::Int32(v) => Cell::Int32(*v),
            KeyValue::Int64(v) => Cell::Int64(*v),
            KeyValue::Text(v) => Cell::Text(v.clone()),
            KeyValue::Date(v) => Cell::Date(v.num_days_from_ce()),
        }
    }

    fn to_key(&self) -> Result<KeyValue, SamplerError> {
        match self {
            Cell::Int32(v) => Ok(KeyValue::Int32(*v)),
            Cell::Int64(v) => Ok(KeyValue::Int64(*v)),
            Cell::Text(v) => Ok(KeyValue::Text(v.clone())),
            Cell::Date(days) => NaiveDate::from_num_days_from_ce_opt(*days)
                .map(KeyValue::Date)
                .ok_or_else(|| {
                    SamplerError::StratumStore(format!("date cell {days} is out of range"))
                }),
            Cell::Float64(v) => Err(SamplerError::StratumStore(format!(
                "float cell {v} cannot be a stratum key"
            ))),
        }
    }
}

/// Tabular form of a stratum set: key columns, `count`, and optional rate.
#[derive(Clone, Debug, PartialEq, bitcode::Encode, bitcode::Decode)]
pub struct StratumTable {
    /// Table name.
    pub name: TableName,
    /// Column layout: key columns, then count, then rate when present.
    pub columns: Vec<ColumnDef>,
    /// Rows in stratum-set order.
    pub rows: Vec<Vec<Cell>>,
    key_width: u32,
    has_rate: bool,
}

impl StratumTable {
    /// Tabulate `set` as `name`, typing key columns by their runtime values.
    ///
    /// The rate column is present only once rates have been attached.
    pub fn from_set(set: &StratumSet, name: impl Into<TableName>) -> Result<Self, SamplerError> {
        let Some(first) = set.strata().first() else {
            return Err(SamplerError::StratumStore(
                "cannot persist an empty stratum set".to_string(),
            ));
        };
        let mut columns = set
            .fields()
            .iter()
            .zip(first.key.values())
            .map(|(field, value)| ColumnDef {
                name: field.name.clone(),
                column_type: ColumnType::for_key(value),
            })
            .collect::<Vec<_>>();
        columns.push(ColumnDef {
            name: COUNT_COLUMN.to_string(),
            column_type: ColumnType::Int64,
        });
        let has_rate = set.has_rates();
        if has_rate {
            columns.push(ColumnDef {
                name: RATE_COLUMN.to_string(),
                column_type: ColumnType::Float64,
            });
        }

        let mut rows = Vec::with_capacity(set.len());
        for stratum in set.strata() {
            let mut row = stratum
                .key
                .values()
                .iter()
                .map(Cell::from_key)
                .collect::<Vec<_>>();
            let count = i64::try_from(stratum.count).map_err(|_| {
                SamplerError::StratumStore(format!(
                    "count {} of stratum '{}' exceeds the count column range",
                    stratum.count, stratum.key
                ))
            })?;
            row.push(Cell::Int64(count));
            if has_rate {
                row.push(Cell::Float64(stratum.rate));
            }
            rows.push(row);
        }

        Ok(Self {
            name: name.into(),
            columns,
            rows,
            key_width: set.fields().len() as u32,
            has_rate,
        })
    }

    /// Key columns in key order.
    pub fn key_columns(&self) -> &[ColumnDef] {
        &self.columns[..self.key_width as usize]
    }

    /// Whether the table carries a rate column.
    pub fn has_rate(&self) -> bool {
        self.has_rate
    }

    /// Number of strata rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Decode rows back into `(key, count, rate)` triples.
    pub fn entries(&self) -> Result<Vec<(StratumKey, u64, Option<f64>)>, SamplerError> {
        let width = self.key_width as usize;
        self.rows
            .iter()
            .map(|row| {
                let expected = width + 1 + usize::from(self.has_rate);
                if row.len() != expected {
                    return Err(SamplerError::StratumStore(format!(
                        "table '{}' row has {} cells, expected {expected}",
                        self.name,
                        row.len()
                    )));
                }
                let key = row[..width]
                    .iter()
                    .map(Cell::to_key)
                    .collect::<Result<Vec<_>, _>>()?;
                let count = match row[width] {
                    Cell::Int64(count) if count >= 0 => count as u64,
                    ref other => {
                        return Err(SamplerError::StratumStore(format!(
                            "invalid count cell {other:?} in table '{}'",
                            self.name
                        )));
                    }
                };
                let rate = match row.get(width + 1) {
                    None => None,
                    Some(Cell::Float64(rate)) => Some(*rate),
                    Some(other) => {
                        return Err(SamplerError::StratumStore(format!(
                            "invalid rate cell {other:?} in table '{}'",
                            self.name
                        )));
                    }
                };
                Ok((StratumKey::new(key), count, rate))
            })
            .collect()
    }

    /// Map each stratum key to its rate, for joining source rows.
    pub fn rate_lookup(&self) -> Result<HashMap<StratumKey, f64>, SamplerError> {
        if !self.has_rate {
            return Err(SamplerError::StratumStore(format!(
                "table '{}' has no {RATE_COLUMN} column",
                self.name
            )));
        }
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|(key, _, rate)| rate.map(|rate| (key, rate)))
            .collect())
    }

    /// Rebuild a stratum set (with rates, when present) from this table.
    pub fn to_stratum_set(&self, sort_mode: SortMode) -> Result<StratumSet, SamplerError> {
        let fields = self
            .key_columns()
            .iter()
            .map(|column| FieldSpec::new(column.name.clone(), column.column_type.field_kind()))
            .collect::<Vec<_>>();
        let entries = self.entries()?;
        let rates = entries
            .iter()
            .map(|(key, _, rate)| (key.clone(), *rate))
            .collect::<HashMap<_, _>>();
        let mut set = StratumSet::build(
            fields,
            entries.into_iter().map(|(key, count, _)| (key, count)),
            StratumOptions {
                min_count: 0,
                sort_mode,
            },
        )?;
        if self.has_rate {
            let aligned = set
                .strata()
                .iter()
                .map(|stratum| rates.get(&stratum.key).copied().flatten().unwrap_or(0.0))
                .collect::<Vec<_>>();
            set.apply_rates(&aligned)?;
        }
        Ok(set)
    }
}

/// Persistence backend for stratum tables.
pub trait StratumTableStore: Send + Sync {
    /// Write `set` as table `table`, replacing any previous table of that name.
    ///
    /// Fails with `StratumStore` for an empty set; nothing is written then.
    fn persist_stratum_table(
        &self,
        set: &StratumSet,
        table: &str,
    ) -> Result<StratumTable, SamplerError>;

    /// Load a previously persisted table.
    fn load_stratum_table(&self, table: &str) -> Result<Option<StratumTable>, SamplerError>;
}

/// File-backed stratum-table store.
pub struct FileStratumStore {
    store: DataStore,
    path: PathBuf,
}

impl fmt::Debug for FileStratumStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStratumStore")
            .field("path", &self.path)
            .finish()
    }
}

impl FileStratumStore {
    /// Open (or create) a file-backed store at `path`.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, SamplerError> {
        let path = coerce_store_path(path.into());
        ensure_parent_dir(&path)?;
        let store = DataStore::open(path.as_path()).map_err(map_store_err)?;
        Ok(Self { store, path })
    }

    /// Default store file path under the crate's default store directory.
    pub fn default_path() -> PathBuf {
        Self::default_path_in_dir(DEFAULT_STORE_DIR)
    }

    /// Default store file path inside a custom directory.
    pub fn default_path_in_dir<P: AsRef<Path>>(dir: P) -> PathBuf {
        dir.as_ref().join(DEFAULT_STORE_FILENAME)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StratumTableStore for FileStratumStore {
    fn persist_stratum_table(
        &self,
        set: &StratumSet,
        table: &str,
    ) -> Result<StratumTable, SamplerError> {
        let tabulated = StratumTable::from_set(set, table)?;
        let payload = encode_table(&tabulated);
        self.store
            .write(&table_key(table), payload.as_slice())
            .map_err(map_store_err)?;
        debug!(
            table,
            rows = tabulated.len(),
            bytes = payload.len(),
            "persisted stratum table"
        );
        Ok(tabulated)
    }

    fn load_stratum_table(&self, table: &str) -> Result<Option<StratumTable>, SamplerError> {
        match self.store.read(&table_key(table)).map_err(map_store_err)? {
            Some(entry) => decode_table(entry.as_ref()).map(Some),
            None => Ok(None),
        }
    }
}

fn table_key(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(TABLE_PREFIX.len() + table.len());
    key.extend_from_slice(TABLE_PREFIX);
    key.extend_from_slice(table.as_bytes());
    key
}

fn encode_table(table: &StratumTable) -> Vec<u8> {
    let payload = encode_bitcode_payload(&bitcode::encode(table));
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(TABLE_RECORD_VERSION);
    buf.extend_from_slice(&payload);
    buf
}

fn decode_table(bytes: &[u8]) -> Result<StratumTable, SamplerError> {
    match bytes.first() {
        Some(&TABLE_RECORD_VERSION) => {}
        Some(_) => {
            return Err(SamplerError::StratumStore(
                "stratum table record version mismatch".into(),
            ));
        }
        None => return Err(SamplerError::StratumStore("empty stratum table record".into())),
    }
    let raw = decode_bitcode_payload(&bytes[1..])?;
    bitcode::decode(&raw)
        .map_err(|err| SamplerError::StratumStore(format!("corrupt stratum table record: {err}")))
}

fn encode_bitcode_payload(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + bytes.len());
    out.push(BITCODE_PREFIX);
    out.extend_from_slice(bytes);
    out
}

fn decode_bitcode_payload(bytes: &[u8]) -> Result<Vec<u8>, SamplerError> {
    if bytes.first().copied() != Some(BITCODE_PREFIX) {
        return Err(SamplerError::StratumStore(
            "bitcode payload missing expected prefix".into(),
        ));
    }
    Ok(bytes[1..].to_vec())
}

fn coerce_store_path(path: PathBuf) -> PathBuf {
    if path.is_dir() {
        return path.join(DEFAULT_STORE_FILENAME);
    }
    path
}

fn ensure_parent_dir(path: &Path) -> Result<(), SamplerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn map_store_err(err: io::Error) -> SamplerError {
    SamplerError::StratumStore(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn loan_set() -> StratumSet {
        let vintage = NaiveDate::from_ymd_opt(2021, 7, 1).unwrap();
        let fields = vec![
            FieldSpec::new("state", FieldKind::Text),
            FieldSpec::new("vintage", FieldKind::Date),
            FieldSpec::new("term", FieldKind::Int32),
        ];
        let rows = vec![
            (
                StratumKey::new(vec!["CA".into(), vintage.into(), KeyValue::Int32(360)]),
                40,
            ),
            (
                StratumKey::new(vec!["TX".into(), vintage.into(), KeyValue::Int32(180)]),
                8,
            ),
        ];
        StratumSet::build(fields, rows, StratumOptions::default()).unwrap()
    }

    #[test]
    fn table_types_columns_from_key_values() {
        let table = StratumTable::from_set(&loan_set(), "tmp.strata").unwrap();
        let types = table
            .columns
            .iter()
            .map(|c| c.column_type)
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                ColumnType::Text,
                ColumnType::Date,
                ColumnType::Int32,
                ColumnType::Int64
            ]
        );
        assert!(!table.has_rate());
        assert!(table.rate_lookup().is_err());
    }

    #[test]
    fn rate_column_follows_attached_rates() {
        let mut set = loan_set();
        set.apply_rates(&[0.25, 1.0]).unwrap();
        let table = StratumTable::from_set(&set, "tmp.strata").unwrap();
        assert_eq!(table.columns.last().unwrap().name, RATE_COLUMN);
        let lookup = table.rate_lookup().unwrap();
        assert_eq!(lookup[&set.strata()[0].key], 0.25);
        assert_eq!(lookup[&set.strata()[1].key], 1.0);

        let rebuilt = table.to_stratum_set(SortMode::ByKeyAsc).unwrap();
        assert_eq!(rebuilt, set);
    }

    #[test]
    fn empty_set_is_not_persisted() {
        let empty = StratumSet::build(
            vec![FieldSpec::new("state", FieldKind::Text)],
            Vec::new(),
            StratumOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            StratumTable::from_set(&empty, "t"),
            Err(SamplerError::StratumStore(_))
        ));
    }

    #[test]
    fn file_store_round_trips_tables_by_name() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strata.bin");
        let mut set = loan_set();
        set.apply_rates(&[0.5, 0.75]).unwrap();
        {
            let store = FileStratumStore::open(&path).unwrap();
            store.persist_stratum_table(&set, "tmp.strata").unwrap();
            assert!(store.load_stratum_table("tmp.other").unwrap().is_none());
        }
        let reopened = FileStratumStore::open(&path).unwrap();
        let table = reopened.load_stratum_table("tmp.strata").unwrap().unwrap();
        assert_eq!(table.name, "tmp.strata");
        assert_eq!(table.to_stratum_set(SortMode::ByKeyAsc).unwrap(), set);
    }

    #[test]
    fn file_store_open_accepts_directory() {
        let dir = tempdir().unwrap();
        let store = FileStratumStore::open(dir.path()).unwrap();
        assert_eq!(store.path(), dir.path().join(DEFAULT_STORE_FILENAME));
    }

    #[test]
    fn decode_rejects_bad_version_and_prefix() {
        assert!(decode_table(&[]).is_err());
        assert!(decode_table(&[TABLE_RECORD_VERSION + 1, BITCODE_PREFIX]).is_err());
        assert!(decode_table(&[TABLE_RECORD_VERSION, 0x00]).is_err());
    }
}
