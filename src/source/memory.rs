use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

use super::jsonl;
use super::{CountsRequest, MaterializeRequest, MaterializeSummary, StratumCounts, StratumSource};
use crate::constants::source::{DEFAULT_SAMPLE_SEED, IN_MEMORY_SOURCE_ID};
use crate::constants::store::{COUNT_COLUMN, RATE_COLUMN};
use crate::errors::SamplerError;
use crate::hash::table_draw_seed;
use crate::key::{FieldKind, FieldSpec, StratumKey, Value};
use crate::strata::{SortMode, StratumSet};
use crate::store::{StratumTable, StratumTableStore};
use crate::types::{SourceId, TableName};

/// Typed rows with a fixed schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Table {
    schema: Vec<FieldSpec>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Create an empty table with `schema`.
    pub fn new(schema: Vec<FieldSpec>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Append a row, checking arity and cell types against the schema.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), SamplerError> {
        if row.len() != self.schema.len() {
            return Err(SamplerError::Configuration(format!(
                "row has {} cells for {} columns",
                row.len(),
                self.schema.len()
            )));
        }
        for (field, cell) in self.schema.iter().zip(&row) {
            if cell.kind() != field.kind {
                return Err(SamplerError::Configuration(format!(
                    "column '{}' expects {} but got {}",
                    field.name,
                    field.kind,
                    cell.kind()
                )));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Column layout.
    pub fn schema(&self) -> &[FieldSpec] {
        &self.schema
    }

    /// Rows in insertion order.
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn positions(&self, fields: &[String]) -> Result<Vec<usize>, SamplerError> {
        fields
            .iter()
            .map(|name| {
                self.schema
                    .iter()
                    .position(|field| &field.name == name)
                    .ok_or_else(|| SamplerError::Configuration(format!("unknown field '{name}'")))
            })
            .collect()
    }

    fn key_at(&self, row: &[Value], positions: &[usize]) -> Option<StratumKey> {
        positions
            .iter()
            .map(|&pos| row.get(pos).and_then(Value::as_key))
            .collect::<Option<Vec<_>>>()
            .map(StratumKey::new)
    }

    fn from_stratum_table(table: &StratumTable) -> Result<Self, SamplerError> {
        let mut schema = table
            .key_columns()
            .iter()
            .map(|column| FieldSpec::new(column.name.clone(), column.column_type.field_kind()))
            .collect::<Vec<_>>();
        schema.push(FieldSpec::new(COUNT_COLUMN, FieldKind::Int64));
        if table.has_rate() {
            schema.push(FieldSpec::new(RATE_COLUMN, FieldKind::Float));
        }
        let mut out = Table::new(schema);
        for (key, count, rate) in table.entries()? {
            let mut row = key.values().iter().cloned().map(Value::from).collect::<Vec<_>>();
            row.push(Value::Int64(count as i64));
            if let Some(rate) = rate {
                row.push(Value::Float(rate));
            }
            out.push_row(row)?;
        }
        Ok(out)
    }
}

/// In-memory data source and stratum store.
///
/// Holds named tables. Materialized samples and persisted stratum tables are
/// written back as tables, so they can be queried like any other relation.
pub struct InMemorySource {
    id: SourceId,
    seed: u64,
    tables: RwLock<HashMap<TableName, Table>>,
    stratum_tables: RwLock<HashMap<TableName, StratumTable>>,
}

impl InMemorySource {
    /// Create an empty source with the default id and draw seed.
    pub fn new() -> Self {
        Self::with_seed(IN_MEMORY_SOURCE_ID, DEFAULT_SAMPLE_SEED)
    }

    /// Create an empty source with an explicit id and draw seed.
    pub fn with_seed(id: impl Into<SourceId>, seed: u64) -> Self {
        Self {
            id: id.into(),
            seed,
            tables: RwLock::new(HashMap::new()),
            stratum_tables: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a table.
    pub fn insert_table(&self, name: impl Into<TableName>, table: Table) -> Result<(), SamplerError> {
        self.tables
            .write()
            .map_err(|_| self.poisoned())?
            .insert(name.into(), table);
        Ok(())
    }

    /// Clone of a registered table.
    pub fn table(&self, name: &str) -> Result<Option<Table>, SamplerError> {
        Ok(self
            .tables
            .read()
            .map_err(|_| self.poisoned())?
            .get(name)
            .cloned())
    }

    /// Load a JSON-lines file into table `name`, returning the row count.
    pub fn load_json_lines(
        &self,
        name: impl Into<TableName>,
        schema: Vec<FieldSpec>,
        path: impl AsRef<Path>,
    ) -> Result<usize, SamplerError> {
        let table = jsonl::read_table(&self.id, schema, path.as_ref())?;
        let rows = table.len();
        self.insert_table(name, table)?;
        Ok(rows)
    }

    /// Write table `name` to a JSON-lines file, returning the row count.
    pub fn export_json_lines(&self, name: &str, path: impl AsRef<Path>) -> Result<usize, SamplerError> {
        let table = self.table(name)?.ok_or_else(|| self.unknown_relation(name))?;
        jsonl::write_table(&table, path.as_ref())?;
        Ok(table.len())
    }

    fn poisoned(&self) -> SamplerError {
        SamplerError::SourceUnavailable {
            source_id: self.id.clone(),
            reason: "table lock poisoned".to_string(),
        }
    }

    fn unknown_relation(&self, name: &str) -> SamplerError {
        SamplerError::SourceUnavailable {
            source_id: self.id.clone(),
            reason: format!("unknown relation '{name}'"),
        }
    }
}

impl Default for InMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl StratumSource for InMemorySource {
    fn id(&self) -> &str {
        &self.id
    }

    fn stratum_counts(&self, request: &CountsRequest) -> Result<StratumCounts, SamplerError> {
        let tables = self.tables.read().map_err(|_| self.poisoned())?;
        let table = tables
            .get(&request.relation)
            .ok_or_else(|| self.unknown_relation(&request.relation))?;
        let positions = table.positions(&request.fields)?;
        let fields = positions
            .iter()
            .map(|&pos| table.schema[pos].clone())
            .collect::<Vec<_>>();
        for field in &fields {
            field.ensure_categorical()?;
        }

        let mut groups: IndexMap<StratumKey, u64> = IndexMap::new();
        for row in &table.rows {
            let key = table.key_at(row, &positions).ok_or_else(|| {
                SamplerError::InvalidStratum("row is missing a grouping value".to_string())
            })?;
            *groups.entry(key).or_insert(0) += 1;
        }

        let mut rows = groups
            .into_iter()
            .filter(|(_, count)| *count >= request.min_count)
            .collect::<Vec<_>>();
        match request.sort_mode {
            SortMode::ByCountDesc => {
                rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            }
            SortMode::ByKeyAsc => rows.sort_by(|a, b| a.0.cmp(&b.0)),
        }
        debug!(
            source = %self.id,
            relation = %request.relation,
            groups = rows.len(),
            "grouped stratum counts"
        );
        Ok(StratumCounts { fields, rows })
    }

    fn materialize_sample(
        &self,
        request: &MaterializeRequest,
        rates: &StratumTable,
    ) -> Result<MaterializeSummary, SamplerError> {
        let key_names = rates
            .key_columns()
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>();
        if key_names != request.stratum_fields.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(SamplerError::Configuration(format!(
                "stratum table '{}' is keyed by {:?}, not {:?}",
                rates.name, key_names, request.stratum_fields
            )));
        }
        let lookup = rates.rate_lookup()?;

        let mut tables = self.tables.write().map_err(|_| self.poisoned())?;
        let source = tables
            .get(&request.source_relation)
            .ok_or_else(|| self.unknown_relation(&request.source_relation))?;
        let positions = source.positions(&request.stratum_fields)?;

        let mut rng = StdRng::seed_from_u64(table_draw_seed(self.seed, &request.destination));
        let mut sample = Table::new(source.schema.clone());
        let mut unmatched = 0u64;
        for row in &source.rows {
            let Some(rate) = source
                .key_at(row, &positions)
                .and_then(|key| lookup.get(&key).copied())
            else {
                unmatched += 1;
                continue;
            };
            if rng.random::<f64>() < rate {
                sample.rows.push(row.clone());
            }
        }

        let summary = MaterializeSummary {
            destination: request.destination.clone(),
            source_rows: source.rows.len() as u64,
            unmatched_rows: unmatched,
            retained_rows: sample.rows.len() as u64,
        };
        tables.insert(request.destination.clone(), sample);
        info!(
            source = %self.id,
            destination = %summary.destination,
            retained = summary.retained_rows,
            scanned = summary.source_rows,
            "materialized sample"
        );
        Ok(summary)
    }
}

impl StratumTableStore for InMemorySource {
    fn persist_stratum_table(
        &self,
        set: &StratumSet,
        table: &str,
    ) -> Result<StratumTable, SamplerError> {
        let tabulated = StratumTable::from_set(set, table)?;
        let queryable = Table::from_stratum_table(&tabulated)?;
        self.insert_table(table, queryable)?;
        self.stratum_tables
            .write()
            .map_err(|_| self.poisoned())?
            .insert(table.to_string(), tabulated.clone());
        Ok(tabulated)
    }

    fn load_stratum_table(&self, table: &str) -> Result<Option<StratumTable>, SamplerError> {
        Ok(self
            .stratum_tables
            .read()
            .map_err(|_| self.poisoned())?
            .get(table)
            .cloned())
    }
}
