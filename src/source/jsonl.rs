use chrono::NaiveDate;
use serde_json::{Map, Number, Value as JsonValue};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::memory::Table;
use crate::constants::report::DATE_FORMAT;
use crate::errors::SamplerError;
use crate::key::{FieldKind, FieldSpec, Value};

/// Read a JSON-lines file (one object per line) into a typed table.
///
/// Every schema column must be present and non-null on every line; extra
/// keys are ignored. Dates are `YYYY-MM-DD` strings.
pub fn read_table(source_id: &str, schema: Vec<FieldSpec>, path: &Path) -> Result<Table, SamplerError> {
    let file = File::open(path).map_err(|err| SamplerError::SourceUnavailable {
        source_id: source_id.to_string(),
        reason: format!("cannot open {}: {err}", path.display()),
    })?;
    let mut table = Table::new(schema.clone());
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row = parse_row(&schema, &line).map_err(|reason| SamplerError::SourceUnavailable {
            source_id: source_id.to_string(),
            reason: format!("{}:{}: {reason}", path.display(), idx + 1),
        })?;
        table.push_row(row)?;
    }
    Ok(table)
}

/// Write a table as JSON lines, one object per row in schema order.
pub fn write_table(table: &Table, path: &Path) -> Result<(), SamplerError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    for row in table.rows() {
        let object = render_row(table.schema(), row);
        let line = serde_json::to_string(&object)
            .map_err(|err| SamplerError::Configuration(format!("unserializable row: {err}")))?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

fn parse_row(schema: &[FieldSpec], line: &str) -> Result<Vec<Value>, String> {
    let object: Map<String, JsonValue> =
        serde_json::from_str(line).map_err(|err| format!("invalid JSON object: {err}"))?;
    schema
        .iter()
        .map(|field| {
            let raw = object
                .get(&field.name)
                .filter(|value| !value.is_null())
                .ok_or_else(|| format!("missing value for '{}'", field.name))?;
            parse_cell(field, raw)
        })
        .collect()
}

fn parse_cell(field: &FieldSpec, raw: &JsonValue) -> Result<Value, String> {
    let mismatch = || format!("'{}' is not a valid {} value: {raw}", field.name, field.kind);
    match field.kind {
        FieldKind::Int32 => raw
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::Int32)
            .ok_or_else(mismatch),
        FieldKind::Int64 => raw.as_i64().map(Value::Int64).ok_or_else(mismatch),
        FieldKind::Text => raw
            .as_str()
            .map(|v| Value::Text(v.to_string()))
            .ok_or_else(mismatch),
        FieldKind::Date => raw
            .as_str()
            .and_then(|v| NaiveDate::parse_from_str(v, DATE_FORMAT).ok())
            .map(Value::Date)
            .ok_or_else(mismatch),
        FieldKind::Float => raw.as_f64().map(Value::Float).ok_or_else(mismatch),
    }
}

fn render_row(schema: &[FieldSpec], row: &[Value]) -> Map<String, JsonValue> {
    schema
        .iter()
        .zip(row)
        .map(|(field, cell)| {
            let value = match cell {
                Value::Int32(v) => JsonValue::from(*v),
                Value::Int64(v) => JsonValue::from(*v),
                Value::Text(v) => JsonValue::from(v.as_str()),
                Value::Date(v) => JsonValue::from(v.format(DATE_FORMAT).to_string()),
                Value::Float(v) => Number::from_f64(*v)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
            };
            (field.name.clone(), value)
        })
        .collect()
}
