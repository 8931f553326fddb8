//! Field schema, categorical key values, and row cells.
//!
//! Strata are defined by equality on categorical values only. `KeyValue` has
//! no floating-point variant, so a float can never become part of a stratum
//! key; float columns may still appear in source rows as `Value::Float`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::report::DATE_FORMAT;
use crate::errors::SamplerError;
use crate::types::FieldName;

/// Column type as reported by a data source schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// 32-bit signed integer.
    Int32,
    /// 64-bit signed integer.
    Int64,
    /// UTF-8 text.
    Text,
    /// Calendar date.
    Date,
    /// Floating point. Never valid as a stratification field.
    Float,
}

impl FieldKind {
    /// Whether values of this kind may define strata.
    pub fn is_categorical(self) -> bool {
        !matches!(self, FieldKind::Float)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::Int32 => "int32",
            FieldKind::Int64 => "int64",
            FieldKind::Text => "text",
            FieldKind::Date => "date",
            FieldKind::Float => "float",
        };
        f.write_str(name)
    }
}

/// Named, typed column.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Column name.
    pub name: FieldName,
    /// Column type.
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Build a field spec from a name and kind.
    pub fn new(name: impl Into<FieldName>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Fail with `InvalidFieldType` unless this field can define strata.
    pub fn ensure_categorical(&self) -> Result<(), SamplerError> {
        if self.kind.is_categorical() {
            return Ok(());
        }
        Err(SamplerError::InvalidFieldType {
            field: self.name.clone(),
            kind: self.kind,
        })
    }
}

/// One categorical component of a stratum key.
///
/// Ordering is derived, so keys compare field by field; within one column all
/// values share a variant because construction checks them against the schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// 32-bit integer value.
    Int32(i32),
    /// 64-bit integer value.
    Int64(i64),
    /// Text value.
    Text(String),
    /// Date value.
    Date(NaiveDate),
}

impl KeyValue {
    /// Column kind matching this value.
    pub fn kind(&self) -> FieldKind {
        match self {
            KeyValue::Int32(_) => FieldKind::Int32,
            KeyValue::Int64(_) => FieldKind::Int64,
            KeyValue::Text(_) => FieldKind::Text,
            KeyValue::Date(_) => FieldKind::Date,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int32(value) => write!(f, "{value}"),
            KeyValue::Int64(value) => write!(f, "{value}"),
            KeyValue::Text(value) => f.write_str(value),
            KeyValue::Date(value) => write!(f, "{}", value.format(DATE_FORMAT)),
        }
    }
}

impl From<i32> for KeyValue {
    fn from(value: i32) -> Self {
        KeyValue::Int32(value)
    }
}

impl From<i64> for KeyValue {
    fn from(value: i64) -> Self {
        KeyValue::Int64(value)
    }
}

impl From<&str> for KeyValue {
    fn from(value: &str) -> Self {
        KeyValue::Text(value.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(value: String) -> Self {
        KeyValue::Text(value)
    }
}

impl From<NaiveDate> for KeyValue {
    fn from(value: NaiveDate) -> Self {
        KeyValue::Date(value)
    }
}

/// Ordered tuple of categorical values identifying one stratum.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StratumKey(Vec<KeyValue>);

impl StratumKey {
    /// Build a key from its components in field order.
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    /// Key components in field order.
    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    /// Number of components.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Project the components at `positions` into a new key.
    pub fn project(&self, positions: &[usize]) -> Option<StratumKey> {
        positions
            .iter()
            .map(|&pos| self.0.get(pos).cloned())
            .collect::<Option<Vec<_>>>()
            .map(StratumKey)
    }
}

impl<V: Into<KeyValue>> FromIterator<V> for StratumKey {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for StratumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        f.write_str(&parts.join(":"))
    }
}

/// One cell of a source row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// 32-bit integer cell.
    Int32(i32),
    /// 64-bit integer cell.
    Int64(i64),
    /// Text cell.
    Text(String),
    /// Date cell.
    Date(NaiveDate),
    /// Floating-point cell.
    Float(f64),
}

impl Value {
    /// Column kind matching this cell.
    pub fn kind(&self) -> FieldKind {
        match self {
            Value::Int32(_) => FieldKind::Int32,
            Value::Int64(_) => FieldKind::Int64,
            Value::Text(_) => FieldKind::Text,
            Value::Date(_) => FieldKind::Date,
            Value::Float(_) => FieldKind::Float,
        }
    }

    /// Categorical view of this cell, `None` for floats.
    pub fn as_key(&self) -> Option<KeyValue> {
        match self {
            Value::Int32(v) => Some(KeyValue::Int32(*v)),
            Value::Int64(v) => Some(KeyValue::Int64(*v)),
            Value::Text(v) => Some(KeyValue::Text(v.clone())),
            Value::Date(v) => Some(KeyValue::Date(*v)),
            Value::Float(_) => None,
        }
    }
}

impl From<KeyValue> for Value {
    fn from(value: KeyValue) -> Self {
        match value {
            KeyValue::Int32(v) => Value::Int32(v),
            KeyValue::Int64(v) => Value::Int64(v),
            KeyValue::Text(v) => Value::Text(v),
            KeyValue::Date(v) => Value::Date(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_fields_are_not_categorical() {
        let field = FieldSpec::new("fico", FieldKind::Float);
        let err = field.ensure_categorical().unwrap_err();
        assert!(matches!(
            err,
            SamplerError::InvalidFieldType { ref field, kind: FieldKind::Float } if field == "fico"
        ));
        assert!(FieldSpec::new("state", FieldKind::Text)
            .ensure_categorical()
            .is_ok());
    }

    #[test]
    fn keys_order_field_by_field() {
        let a: StratumKey = ["CA", "P"].into_iter().collect();
        let b: StratumKey = ["CA", "R"].into_iter().collect();
        let c: StratumKey = ["AZ", "R"].into_iter().collect();
        let mut keys = vec![b.clone(), a.clone(), c.clone()];
        keys.sort();
        assert_eq!(keys, vec![c, a, b]);
    }

    #[test]
    fn date_keys_render_as_iso_dates() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let key = StratumKey::new(vec![KeyValue::Date(date), KeyValue::Int32(7)]);
        assert_eq!(key.to_string(), "2024-03-09:7");
    }

    #[test]
    fn float_cells_have_no_key_view() {
        assert_eq!(Value::Float(1.5).as_key(), None);
        assert_eq!(
            Value::Text("CA".into()).as_key(),
            Some(KeyValue::Text("CA".into()))
        );
    }

    #[test]
    fn project_picks_components_in_order() {
        let key: StratumKey = ["CA", "P", "30"].into_iter().collect();
        let expected: StratumKey = ["30", "CA"].into_iter().collect();
        assert_eq!(key.project(&[2, 0]).unwrap(), expected);
        assert!(key.project(&[5]).is_none());
    }
}
